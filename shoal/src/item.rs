//! Cache item and input validation.

use bytes::Bytes;
use shoal_protocol::{MAX_VALUE_LENGTH, is_valid_key};

use crate::Error;

/// An item to store into or read out of the cache fleet.
///
/// Items are created per call and never retained by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// The item's key: at most 250 bytes of printable non-space characters.
    pub key: String,

    /// The item's value, at most 1 MiB on a stock memcached build.
    pub value: Bytes,

    /// Server-opaque flags; semantics are entirely up to the application.
    pub flags: u32,

    /// Data version id, aka CAS. Zero means "store unconditionally";
    /// nonzero means the store only succeeds while the server-side entry
    /// still carries this version.
    pub data_version_id: u64,

    /// Expiration in seconds: relative time up to 30 days, an absolute
    /// Unix timestamp beyond that, or 0 for no expiration.
    pub expiration: u32,
}

impl Item {
    /// A plain item with default flags, no CAS check and no expiration.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            ..Item::default()
        }
    }
}

/// Reject keys that memcached would refuse or that would corrupt the ASCII
/// protocol's line framing.
pub(crate) fn validate_key(key: &str) -> Result<(), Error> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_owned()))
    }
}

/// Reject values above the server's item size limit.
pub(crate) fn validate_value(value: &[u8]) -> Result<(), Error> {
    if value.len() > MAX_VALUE_LENGTH {
        Err(Error::ValueTooLarge(value.len()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_new_defaults() {
        let item = Item::new("counter", "42");
        assert_eq!(item.key, "counter");
        assert_eq!(&item.value[..], b"42");
        assert_eq!(item.flags, 0);
        assert_eq!(item.data_version_id, 0);
        assert_eq!(item.expiration, 0);
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("fine").is_ok());
        assert!(matches!(
            validate_key("not fine"),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            validate_key(&"k".repeat(251)),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn value_validation() {
        assert!(validate_value(&[]).is_ok());
        assert!(validate_value(&vec![0u8; 1024 * 1024]).is_ok());
        assert!(matches!(
            validate_value(&vec![0u8; 1024 * 1024 + 1]),
            Err(Error::ValueTooLarge(_))
        ));
    }
}
