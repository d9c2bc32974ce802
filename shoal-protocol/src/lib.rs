//! Client-side Memcache wire codecs.
//!
//! This crate implements the byte-level halves of both Memcache protocols:
//!
//! - **Binary**: fixed 24-byte headers (request magic `0x80`, response magic
//!   `0x81`), big-endian fields, operation-specific fixed-width extras.
//! - **ASCII**: `\r\n`-terminated command and reply lines, with values
//!   carried as a declared byte count followed by a bare `\r\n`.
//!
//! Everything here is pure: encoders write into caller-provided buffers and
//! parsers consume byte slices. No I/O happens in this crate and nothing is
//! logged; violations are reported as structured [`ParseError`]s for the
//! connection-owning layer to act on.

pub mod ascii;
pub mod binary;
mod error;
mod opcode;
mod status;

pub use error::ParseError;
pub use opcode::Opcode;
pub use status::ResponseStatus;

/// Maximum key length accepted by memcached.
pub const MAX_KEY_LENGTH: usize = 250;

/// Maximum value length accepted by a stock memcached build (1 MiB).
pub const MAX_VALUE_LENGTH: usize = 1024 * 1024;

/// Returns true if `key` is a wire-legal memcache key: at most
/// [`MAX_KEY_LENGTH`] bytes, every byte in `[0x21, 0x7e]` or `[0x80, 0xff]`
/// (printable, no whitespace or control characters).
pub fn is_valid_key(key: &str) -> bool {
    if key.len() > MAX_KEY_LENGTH {
        return false;
    }
    key.bytes()
        .all(|b| (0x21..=0x7e).contains(&b) || b >= 0x80)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_charset() {
        assert!(is_valid_key("simple-key"));
        assert!(is_valid_key("k"));
        assert!(is_valid_key("!~"));
        assert!(is_valid_key(std::str::from_utf8(b"caf\xc3\xa9").unwrap()));

        assert!(!is_valid_key("has space"));
        assert!(!is_valid_key("has\ttab"));
        assert!(!is_valid_key("has\r\nnewline"));
        assert!(!is_valid_key("nul\0byte"));
    }

    #[test]
    fn key_length_limit() {
        assert!(is_valid_key(&"x".repeat(250)));
        assert!(!is_valid_key(&"x".repeat(251)));
    }
}
