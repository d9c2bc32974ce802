//! Connection collaborator contract.
//!
//! The client core does not own connection establishment, pooling, idle
//! eviction or deadlines; it drives whatever duplex channels an external
//! pool hands out and reports back, through [`ConnectionPool::release`] and
//! [`ConnectionPool::discard`], whether each channel is still safe to
//! reuse.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Error;

/// A duplex byte channel to one memcache server.
///
/// Blanket-implemented for anything that can read and write asynchronously;
/// deadlines and cancellation live inside the implementation, surfacing
/// here as ordinary I/O errors.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Channel for T {}

/// A pooled connection handle: the channel plus the endpoint it belongs to,
/// so the pool can file it back under the right server.
pub struct PoolConn {
    pub addr: String,
    pub channel: Box<dyn Channel>,
}

impl PoolConn {
    pub fn new(addr: impl Into<String>, channel: impl Channel + 'static) -> Self {
        PoolConn {
            addr: addr.into(),
            channel: Box::new(channel),
        }
    }
}

impl std::fmt::Debug for PoolConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConn").field("addr", &self.addr).finish()
    }
}

/// External connection pool contract.
///
/// The topology layer calls [`register`](ConnectionPool::register) /
/// [`unregister`](ConnectionPool::unregister) as shards join and leave, and
/// [`get`](ConnectionPool::get) while holding its own topology read lock;
/// implementations must not call back into the shard manager or they will
/// deadlock.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Produce a connection to `addr`, blocking (subject to the pool's own
    /// deadlines) until one is available.
    async fn get(&self, addr: &str) -> Result<PoolConn, Error>;

    /// Return a healthy connection for reuse.
    async fn release(&self, conn: PoolConn);

    /// Drop a connection that must not be reused (transport failure or
    /// protocol desync).
    async fn discard(&self, conn: PoolConn);

    /// Make `addr` available for `get`.
    async fn register(&self, addr: &str) -> Result<(), Error>;

    /// Remove `addr`; outstanding connections may still be released or
    /// discarded afterwards.
    async fn unregister(&self, addr: &str) -> Result<(), Error>;
}
