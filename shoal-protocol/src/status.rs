//! Response status codes shared by both protocols.

/// Status returned by the server in a well-formed response.
///
/// The binary protocol carries the status in header bytes 6..8; the ASCII
/// protocol's single-token replies are mapped onto the same set by the
/// client so callers see one status vocabulary regardless of codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseStatus {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    IncrDecrOnNonNumericValue = 0x0006,
    VbucketBelongsToAnotherServer = 0x0007,
    AuthenticationError = 0x0008,
    AuthenticationContinue = 0x0009,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TempFailure = 0x0086,
}

impl ResponseStatus {
    /// Map a wire value to a status. Unknown values return `None`.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(ResponseStatus::NoError),
            0x0001 => Some(ResponseStatus::KeyNotFound),
            0x0002 => Some(ResponseStatus::KeyExists),
            0x0003 => Some(ResponseStatus::ValueTooLarge),
            0x0004 => Some(ResponseStatus::InvalidArguments),
            0x0005 => Some(ResponseStatus::ItemNotStored),
            0x0006 => Some(ResponseStatus::IncrDecrOnNonNumericValue),
            0x0007 => Some(ResponseStatus::VbucketBelongsToAnotherServer),
            0x0008 => Some(ResponseStatus::AuthenticationError),
            0x0009 => Some(ResponseStatus::AuthenticationContinue),
            0x0081 => Some(ResponseStatus::UnknownCommand),
            0x0082 => Some(ResponseStatus::OutOfMemory),
            0x0083 => Some(ResponseStatus::NotSupported),
            0x0084 => Some(ResponseStatus::InternalError),
            0x0085 => Some(ResponseStatus::Busy),
            0x0086 => Some(ResponseStatus::TempFailure),
            _ => None,
        }
    }

    /// Returns true for [`ResponseStatus::NoError`].
    pub fn is_success(&self) -> bool {
        *self == ResponseStatus::NoError
    }

    /// Short human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::NoError => "no error",
            ResponseStatus::KeyNotFound => "key not found",
            ResponseStatus::KeyExists => "key exists",
            ResponseStatus::ValueTooLarge => "value too large",
            ResponseStatus::InvalidArguments => "invalid arguments",
            ResponseStatus::ItemNotStored => "item not stored",
            ResponseStatus::IncrDecrOnNonNumericValue => "incr/decr on non-numeric value",
            ResponseStatus::VbucketBelongsToAnotherServer => {
                "vbucket belongs to another server"
            }
            ResponseStatus::AuthenticationError => "authentication error",
            ResponseStatus::AuthenticationContinue => "authentication continue",
            ResponseStatus::UnknownCommand => "unknown command",
            ResponseStatus::OutOfMemory => "server out of memory",
            ResponseStatus::NotSupported => "not supported",
            ResponseStatus::InternalError => "server internal error",
            ResponseStatus::Busy => "server busy",
            ResponseStatus::TempFailure => "temporary server failure",
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for value in 0u16..=0x100 {
            if let Some(status) = ResponseStatus::from_u16(value) {
                assert_eq!(status as u16, value);
            }
        }
    }

    #[test]
    fn unknown_values_rejected() {
        assert_eq!(ResponseStatus::from_u16(0x000a), None);
        assert_eq!(ResponseStatus::from_u16(0x0080), None);
        assert_eq!(ResponseStatus::from_u16(0xffff), None);
    }

    #[test]
    fn success() {
        assert!(ResponseStatus::NoError.is_success());
        assert!(!ResponseStatus::KeyNotFound.is_success());
        assert!(!ResponseStatus::TempFailure.is_success());
    }
}
