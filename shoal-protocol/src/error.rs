//! Codec error type.

/// A wire-protocol violation detected while encoding or decoding.
///
/// With the exception of value-count surprises the client layer chooses to
/// tolerate, any of these on a live connection means the client and server
/// no longer agree on framing, and the connection must not be reused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Fewer bytes available than the frame declared.
    #[error("truncated frame")]
    Truncated,

    /// First byte of a binary frame was not the expected magic.
    #[error("invalid magic byte: {0:#04x}")]
    BadMagic(u8),

    /// Response opcode byte does not name a supported operation.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Response echoed a different opcode than the request that was sent.
    #[error("unexpected response opcode: expected {expected:#04x}, found {found:#04x}")]
    UnexpectedOpcode { expected: u8, found: u8 },

    /// Memcache defines a single data type (0x00).
    #[error("invalid data type: {0:#04x}")]
    BadDataType(u8),

    /// `total_body_length` is smaller than `key_length + extras_length`.
    #[error("inconsistent body length: total {total_body}, key {key_len}, extras {extras_len}")]
    LengthMismatch {
        total_body: u32,
        key_len: u16,
        extras_len: u8,
    },

    /// The extras region was not consumed exactly by the operation's fields.
    #[error("{0} extras byte(s) left unconsumed")]
    TrailingExtras(usize),

    /// A successful response arrived without the extras its operation
    /// requires.
    #[error("expected extras payload")]
    MissingExtras,

    /// An ASCII reply line did not match any shape the protocol allows here.
    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    /// A numeric field failed to parse as unsigned decimal.
    #[error("invalid number")]
    InvalidNumber,

    /// A value block was not followed by the mandatory `\r\n`.
    #[error("missing value terminator")]
    CorruptValueTerminator,
}
