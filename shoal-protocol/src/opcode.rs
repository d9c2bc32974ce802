//! Binary protocol opcodes.

/// Operations this client supports on the binary protocol.
///
/// The enum is closed over exactly the supported command set: quiet
/// variants, SASL, vbucket and TAP opcodes are unrepresentable, so an
/// unsupported operation cannot be encoded in the first place and an
/// unexpected opcode byte in a response fails [`Opcode::from_u8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Flush = 0x08,
    Version = 0x0b,
    GetK = 0x0c,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Verbosity = 0x1b,
}

impl Opcode {
    /// Map a wire byte to a supported opcode. Unsupported bytes return `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x08 => Some(Opcode::Flush),
            0x0b => Some(Opcode::Version),
            0x0c => Some(Opcode::GetK),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            0x10 => Some(Opcode::Stat),
            0x1b => Some(Opcode::Verbosity),
            _ => None,
        }
    }
}
