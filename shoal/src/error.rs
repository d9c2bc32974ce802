//! Client error taxonomy.
//!
//! Errors fall into five families with different consequences for the
//! connection that produced them:
//!
//! - **Validation** (bad key/value, CAS on an ASCII op that can't express
//!   it): caught before any I/O; the connection is untouched.
//! - **Transport** ([`Error::Io`]): the connection is poisoned and must be
//!   discarded.
//! - **Desync** ([`Error::Protocol`], residual buffer bytes): the client and
//!   server disagree on framing; the connection is poisoned.
//! - **Server status** ([`Error::Status`], [`Error::Server`]): the request
//!   itself failed but framing is intact; the connection stays healthy.
//! - **Sharding** ([`Error::NoShard`], [`Error::ConnectionUnavailable`]):
//!   produced per key by the fan-out layer without touching other shards.

use std::io;
use std::sync::Arc;

use shoal_protocol::{ParseError, ResponseStatus};

/// Error type shared by every layer of the client.
///
/// `Clone` is deliberate: a single transport failure inside a pipelined
/// batch is fanned out to every remaining entry of that batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Key is longer than 250 bytes or contains illegal bytes.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// Value exceeds the 1 MiB item limit.
    #[error("invalid value: {0} bytes exceeds the 1 MiB limit")]
    ValueTooLarge(usize),

    /// The ASCII protocol can only express a CAS check on `set`.
    #[error("ascii protocol does not support {0} with a cas id")]
    CasUnsupported(&'static str),

    /// The ASCII counter commands cannot seed a missing key; expiration
    /// must be `0xffffffff`.
    #[error("ascii protocol does not support counter seeding; expiration must be 0xffffffff")]
    CounterSeedUnsupported,

    /// The ASCII `stats` command only supports the default statistics set.
    #[error("ascii protocol does not support keyed stats lookup")]
    KeyedStatsUnsupported,

    /// Transport failure, including deadline expiry on the underlying
    /// connection. The cause is shared so batch entries can carry the same
    /// failure.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// Wire-protocol violation; see [`shoal_protocol::ParseError`].
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The write buffer still held bytes after an exchange completed.
    #[error("write buffer not fully flushed")]
    UnflushedWrite,

    /// The read buffer still held bytes after an exchange completed.
    #[error("read buffer not fully drained")]
    UndrainedRead,

    /// The server answered with a non-success status.
    #[error("memcache status: {0}")]
    Status(ResponseStatus),

    /// The server answered with an error line instead of a reply.
    #[error("server error: {0:?}")]
    Server(String),

    /// The connection was poisoned by an earlier failure; nothing was sent.
    ///
    /// Every entry after the first failure of a large batch carries this
    /// value, so callers logging errors can cheaply skip the flood and
    /// report only the failure that tripped the state.
    #[error("skipping due to previous error")]
    InvalidState,

    /// The key hashes to no shard (empty topology).
    #[error("no memcache shards for key {0:?}")]
    NoShard(String),

    /// The shard is known but no connection could be produced for it.
    #[error("connection unavailable for memcache shard {shard}")]
    ConnectionUnavailable {
        shard: String,
        cause: Option<Box<Error>>,
    },

    /// The decoded value is not valid UTF-8 (typed-decode helpers).
    #[error("value is not valid utf-8")]
    ValueNotUtf8,

    /// The decoded value is not a decimal number (typed-decode helpers).
    #[error("value is not a decimal number")]
    ValueNotNumeric,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// True for the shared poisoned-connection marker.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState)
    }

    /// The server status behind this error, if it is a status error.
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            Error::Status(status) => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_cloneable() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded").into();
        let copy = err.clone();
        assert!(matches!(copy, Error::Io(_)));
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn status_accessor() {
        assert_eq!(
            Error::Status(ResponseStatus::KeyExists).status(),
            Some(ResponseStatus::KeyExists)
        );
        assert_eq!(Error::InvalidState.status(), None);
    }

    #[test]
    fn invalid_state_marker() {
        assert!(Error::InvalidState.is_invalid_state());
        assert!(!Error::UnflushedWrite.is_invalid_state());
        assert_eq!(
            Error::InvalidState.to_string(),
            "skipping due to previous error"
        );
    }
}
