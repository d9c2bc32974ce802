//! Unified response model.
//!
//! Every operation returns exactly one response value, constructed at the
//! moment the operation completes and never mutated afterwards. The same
//! types are produced by both protocol clients and by the sharded client,
//! so callers see one result vocabulary regardless of codec or routing.
//!
//! Status/error semantics are shared across all response kinds:
//! [`status()`](GetResponse::status) reports what the server said, while
//! [`error()`](GetResponse::error) folds client-side failures and
//! non-success statuses into one optional error, with the single exception
//! that `KeyNotFound` on a get is an ordinary miss, not an error.

use std::collections::HashMap;

use bytes::Bytes;
use shoal_protocol::ResponseStatus;

use crate::{Error, ShardId};

fn status_error(status: ResponseStatus) -> Option<Error> {
    if status.is_success() {
        None
    } else {
        Some(Error::Status(status))
    }
}

/// Result of a get operation.
#[derive(Debug, Clone)]
pub struct GetResponse {
    key: String,
    status: ResponseStatus,
    error: Option<Error>,
    value: Bytes,
    flags: u32,
    data_version_id: u64,
}

impl GetResponse {
    /// Build a response from a decoded status. Value, flags and version are
    /// only retained when the server reported success.
    pub fn new(
        key: impl Into<String>,
        status: ResponseStatus,
        flags: u32,
        value: Bytes,
        data_version_id: u64,
    ) -> Self {
        let found = status.is_success();
        GetResponse {
            key: key.into(),
            status,
            error: None,
            value: if found { value } else { Bytes::new() },
            flags: if found { flags } else { 0 },
            data_version_id: if found { data_version_id } else { 0 },
        }
    }

    /// A cache miss.
    pub fn miss(key: impl Into<String>) -> Self {
        Self::new(key, ResponseStatus::KeyNotFound, 0, Bytes::new(), 0)
    }

    /// A response for an operation that failed client-side.
    pub fn from_error(key: impl Into<String>, error: Error) -> Self {
        GetResponse {
            key: key.into(),
            status: ResponseStatus::NoError,
            error: Some(error),
            value: Bytes::new(),
            flags: 0,
            data_version_id: 0,
        }
    }

    /// The status reported by the server. Only meaningful when
    /// [`error()`](Self::error) is `None`.
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// The failure behind this response, if any. `KeyNotFound` is a valid
    /// miss on get paths and reports no error.
    pub fn error(&self) -> Option<Error> {
        if let Some(err) = &self.error {
            return Some(err.clone());
        }
        match self.status {
            ResponseStatus::KeyNotFound => None,
            status => status_error(status),
        }
    }

    /// The requested key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True when the entry was found.
    pub fn found(&self) -> bool {
        self.error.is_none() && self.status.is_success()
    }

    /// The retrieved value; empty unless the entry was found.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Entry flags; only valid when the entry was found.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Data version id (CAS); only valid when the entry was found.
    pub fn data_version_id(&self) -> u64 {
        self.data_version_id
    }

    /// The value decoded as UTF-8 text.
    pub fn value_str(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.value).map_err(|_| Error::ValueNotUtf8)
    }

    /// The value decoded as an unsigned decimal, the representation the
    /// server's counter operations require.
    pub fn value_u64(&self) -> Result<u64, Error> {
        self.value_str()?.parse().map_err(|_| Error::ValueNotNumeric)
    }
}

/// Result of a set/add/replace/delete/append/prepend operation.
#[derive(Debug, Clone)]
pub struct MutateResponse {
    key: String,
    status: ResponseStatus,
    error: Option<Error>,
    data_version_id: u64,
}

impl MutateResponse {
    /// Build a response from a decoded status. The version id is only
    /// retained on success; deletes and ASCII stores always report zero.
    pub fn new(key: impl Into<String>, status: ResponseStatus, data_version_id: u64) -> Self {
        MutateResponse {
            key: key.into(),
            status,
            error: None,
            data_version_id: if status.is_success() {
                data_version_id
            } else {
                0
            },
        }
    }

    /// A response for an operation that failed client-side.
    pub fn from_error(key: impl Into<String>, error: Error) -> Self {
        MutateResponse {
            key: key.into(),
            status: ResponseStatus::NoError,
            error: Some(error),
            data_version_id: 0,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn error(&self) -> Option<Error> {
        self.error
            .clone()
            .or_else(|| status_error(self.status))
    }

    /// The input key; batched mutations may complete out of order across
    /// shards, so responses carry their keys.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The stored entry's new data version id (CAS). Zero for deletes.
    pub fn data_version_id(&self) -> u64 {
        self.data_version_id
    }
}

/// Result of an increment/decrement operation.
#[derive(Debug, Clone)]
pub struct CountResponse {
    key: String,
    status: ResponseStatus,
    error: Option<Error>,
    count: u64,
}

impl CountResponse {
    pub fn new(key: impl Into<String>, status: ResponseStatus, count: u64) -> Self {
        CountResponse {
            key: key.into(),
            status,
            error: None,
            count: if status.is_success() { count } else { 0 },
        }
    }

    pub fn from_error(key: impl Into<String>, error: Error) -> Self {
        CountResponse {
            key: key.into(),
            status: ResponseStatus::NoError,
            error: Some(error),
            count: 0,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn error(&self) -> Option<Error> {
        self.error
            .clone()
            .or_else(|| status_error(self.status))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The counter value after the operation; zero on error.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Result of a version request, possibly merged across shards.
#[derive(Debug, Clone)]
pub struct VersionResponse {
    status: ResponseStatus,
    error: Option<Error>,
    versions: HashMap<ShardId, String>,
}

impl VersionResponse {
    pub fn new(status: ResponseStatus, versions: HashMap<ShardId, String>) -> Self {
        VersionResponse {
            status,
            error: None,
            versions,
        }
    }

    pub fn from_error(error: Error, versions: HashMap<ShardId, String>) -> Self {
        VersionResponse {
            status: ResponseStatus::NoError,
            error: Some(error),
            versions,
        }
    }

    /// For a sharded client this is the first non-success status seen.
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// For a sharded client this is the first error seen.
    pub fn error(&self) -> Option<Error> {
        self.error
            .clone()
            .or_else(|| status_error(self.status))
    }

    /// Version string per shard id (shard 0 for unsharded clients).
    pub fn versions(&self) -> &HashMap<ShardId, String> {
        &self.versions
    }
}

/// Result of a stat request, possibly merged across shards.
#[derive(Debug, Clone)]
pub struct StatResponse {
    status: ResponseStatus,
    error: Option<Error>,
    entries: HashMap<ShardId, HashMap<String, String>>,
}

impl StatResponse {
    pub fn new(
        status: ResponseStatus,
        entries: HashMap<ShardId, HashMap<String, String>>,
    ) -> Self {
        StatResponse {
            status,
            error: None,
            entries,
        }
    }

    pub fn from_error(
        error: Error,
        entries: HashMap<ShardId, HashMap<String, String>>,
    ) -> Self {
        StatResponse {
            status: ResponseStatus::NoError,
            error: Some(error),
            entries,
        }
    }

    /// For a sharded client this is the first non-success status seen.
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// For a sharded client this is the first error seen.
    pub fn error(&self) -> Option<Error> {
        self.error
            .clone()
            .or_else(|| status_error(self.status))
    }

    /// Stat entries per shard id (shard 0 for unsharded clients).
    pub fn entries(&self) -> &HashMap<ShardId, HashMap<String, String>> {
        &self.entries
    }
}

/// Result of a flush or verbosity request.
#[derive(Debug, Clone)]
pub struct GenericResponse {
    status: ResponseStatus,
    error: Option<Error>,
}

impl GenericResponse {
    pub fn new(status: ResponseStatus) -> Self {
        GenericResponse {
            status,
            error: None,
        }
    }

    pub fn from_error(error: Error) -> Self {
        GenericResponse {
            status: ResponseStatus::NoError,
            error: Some(error),
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn error(&self) -> Option<Error> {
        self.error
            .clone()
            .or_else(|| status_error(self.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_not_found_is_not_an_error() {
        let miss = GetResponse::miss("k");
        assert_eq!(miss.status(), ResponseStatus::KeyNotFound);
        assert!(miss.error().is_none());
        assert!(!miss.found());
    }

    #[test]
    fn mutate_not_found_is_an_error() {
        let resp = MutateResponse::new("k", ResponseStatus::KeyNotFound, 0);
        assert!(matches!(
            resp.error(),
            Some(Error::Status(ResponseStatus::KeyNotFound))
        ));
    }

    #[test]
    fn get_payload_zeroed_unless_found() {
        let resp = GetResponse::new(
            "k",
            ResponseStatus::InternalError,
            7,
            Bytes::from_static(b"junk"),
            99,
        );
        assert!(resp.value().is_empty());
        assert_eq!(resp.flags(), 0);
        assert_eq!(resp.data_version_id(), 0);
        assert!(resp.error().is_some());
    }

    #[test]
    fn get_hit_carries_payload() {
        let resp = GetResponse::new(
            "k",
            ResponseStatus::NoError,
            7,
            Bytes::from_static(b"World"),
            99,
        );
        assert!(resp.found());
        assert_eq!(resp.value().as_ref(), b"World");
        assert_eq!(resp.flags(), 7);
        assert_eq!(resp.data_version_id(), 99);
        assert!(resp.error().is_none());
    }

    #[test]
    fn typed_value_decoding() {
        let resp = GetResponse::new("k", ResponseStatus::NoError, 0, Bytes::from_static(b"16"), 1);
        assert_eq!(resp.value_str().unwrap(), "16");
        assert_eq!(resp.value_u64().unwrap(), 16);

        let resp =
            GetResponse::new("k", ResponseStatus::NoError, 0, Bytes::from_static(b"abc"), 1);
        assert!(matches!(resp.value_u64(), Err(Error::ValueNotNumeric)));

        let resp = GetResponse::new(
            "k",
            ResponseStatus::NoError,
            0,
            Bytes::from_static(&[0xff, 0xfe]),
            1,
        );
        assert!(matches!(resp.value_str(), Err(Error::ValueNotUtf8)));
    }

    #[test]
    fn count_zeroed_on_error_status() {
        let resp = CountResponse::new("k", ResponseStatus::KeyNotFound, 42);
        assert_eq!(resp.count(), 0);
        assert!(resp.error().is_some());
    }

    #[test]
    fn client_error_takes_precedence() {
        let resp = MutateResponse::from_error("k", Error::InvalidState);
        assert!(matches!(resp.error(), Some(Error::InvalidState)));
        assert_eq!(resp.status(), ResponseStatus::NoError);
    }

    #[test]
    fn generic_status_error() {
        assert!(GenericResponse::new(ResponseStatus::NoError).error().is_none());
        assert!(
            GenericResponse::new(ResponseStatus::Busy)
                .error()
                .is_some()
        );
    }
}
