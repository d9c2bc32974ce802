//! Client library for a sharded memcache fleet.
//!
//! The crate is layered bottom-up:
//!
//! - [`RawBinaryClient`] and [`RawAsciiClient`] drive one duplex channel
//!   each, speaking the binary and ASCII protocols through the codecs in
//!   `shoal-protocol`. [`RawClient`] unifies them behind one operation
//!   surface.
//! - [`ShardManager`] tracks the shard fleet, routes keys with the
//!   `shoal-ring` consistent-hash ring, and borrows connections from an
//!   external [`ConnectionPool`].
//! - [`ShardedClient`] fans single and batched operations out to the
//!   shard(s) they belong to and merges the per-shard results.
//!
//! Connections carry typed protocol state: after a transport failure or
//! framing violation a client is *poisoned*. Every further call fails
//! immediately with [`Error::InvalidState`] and the channel can only be
//! recovered as [`Disposition::Discard`], never released back to the pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shoal::{ConnectionPool, Item, Protocol, ShardManager, ShardSpec, ShardedClient};
//!
//! async fn example(pool: Arc<dyn ConnectionPool>) {
//!     let manager = Arc::new(
//!         ShardManager::new_static(
//!             pool,
//!             vec![
//!                 ShardSpec::active("cache0", 11211),
//!                 ShardSpec::active("cache1", 11211),
//!             ],
//!         )
//!         .await,
//!     );
//!     let client = ShardedClient::new(manager, Protocol::Binary);
//!
//!     client.set(&Item::new("greeting", "hello")).await;
//!     let resp = client.get("greeting").await;
//!     assert_eq!(resp.value().as_ref(), b"hello");
//! }
//! ```

mod client;
mod error;
mod item;
mod pool;
mod raw_ascii;
mod raw_binary;
mod response;
mod sharded;
mod topology;

pub use client::{Disposition, Protocol, RawClient};
pub use error::Error;
pub use item::Item;
pub use pool::{Channel, ConnectionPool, PoolConn};
pub use raw_ascii::RawAsciiClient;
pub use raw_binary::RawBinaryClient;
pub use response::{
    CountResponse, GenericResponse, GetResponse, MutateResponse, StatResponse, VersionResponse,
};
pub use sharded::ShardedClient;
pub use topology::{ShardLifecycle, ShardLookup, ShardManager, ShardMapping, ShardSpec};

pub use shoal_protocol::{MAX_KEY_LENGTH, MAX_VALUE_LENGTH, ParseError, ResponseStatus};

/// Identifier of one shard within the current topology: its index in the
/// shard list, or [`UNMAPPED_SHARD`] for keys no shard owns.
pub type ShardId = i32;

/// The synthetic shard id for keys that map to no shard.
pub const UNMAPPED_SHARD: ShardId = -1;
