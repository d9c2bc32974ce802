//! Protocol selection and the unified per-connection client.
//!
//! [`RawClient`] folds the two protocol clients into one operation surface
//! so routing code never branches on the wire format. The connection's
//! validity is a typed state: once poisoned, every operation short-circuits
//! with [`Error::InvalidState`](crate::Error::InvalidState), and
//! [`finish`](RawClient::finish) can only hand the channel back as
//! [`Disposition::Discard`].

use std::collections::HashMap;

use bytes::Bytes;

use crate::pool::Channel;
use crate::response::{
    CountResponse, GenericResponse, GetResponse, MutateResponse, StatResponse, VersionResponse,
};
use crate::{Item, RawAsciiClient, RawBinaryClient, ShardId};

/// Which wire protocol to speak on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Binary,
    Ascii,
}

/// Health of one connection's protocol state.
///
/// `Poisoned` is absorbing: nothing transitions back to `Healthy` for the
/// life of the connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Healthy,
    Poisoned,
}

impl ConnState {
    pub(crate) fn is_healthy(self) -> bool {
        self == ConnState::Healthy
    }

    pub(crate) fn is_poisoned(self) -> bool {
        self == ConnState::Poisoned
    }

    /// Tag a channel with this state's verdict.
    pub(crate) fn dispose<C>(self, channel: C) -> Disposition<C> {
        match self {
            ConnState::Healthy => Disposition::Reuse(channel),
            ConnState::Poisoned => Disposition::Discard(channel),
        }
    }
}

/// What to do with a channel recovered from a finished client.
///
/// A healthy client yields `Reuse`; a poisoned one can only yield
/// `Discard`, so the release-vs-discard decision is made by the type
/// rather than by a flag check at every call site.
#[derive(Debug)]
pub enum Disposition<C> {
    /// The connection is in a known-good state and may be pooled again.
    Reuse(C),
    /// The connection is desynced or broken and must be dropped.
    Discard(C),
}

/// A per-connection client speaking either protocol.
pub enum RawClient<C> {
    Binary(RawBinaryClient<C>),
    Ascii(RawAsciiClient<C>),
}

macro_rules! delegate {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            RawClient::Binary(client) => client.$method($($arg),*).await,
            RawClient::Ascii(client) => client.$method($($arg),*).await,
        }
    };
}

impl<C: Channel> RawClient<C> {
    /// Wrap an established channel with a client for `protocol`.
    pub fn new(protocol: Protocol, shard: ShardId, channel: C) -> Self {
        match protocol {
            Protocol::Binary => RawClient::Binary(RawBinaryClient::new(shard, channel)),
            Protocol::Ascii => RawClient::Ascii(RawAsciiClient::new(shard, channel)),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        match self {
            RawClient::Binary(client) => client.shard_id(),
            RawClient::Ascii(client) => client.shard_id(),
        }
    }

    pub fn is_valid_state(&self) -> bool {
        match self {
            RawClient::Binary(client) => client.is_valid_state(),
            RawClient::Ascii(client) => client.is_valid_state(),
        }
    }

    /// Consume the client and recover the channel, tagged with whether it
    /// is safe to reuse.
    pub fn finish(self) -> Disposition<C> {
        match self {
            RawClient::Binary(client) => client.finish(),
            RawClient::Ascii(client) => client.finish(),
        }
    }

    pub async fn get(&mut self, key: &str) -> GetResponse {
        delegate!(self.get(key))
    }

    pub async fn get_multi<S: AsRef<str>>(&mut self, keys: &[S]) -> HashMap<String, GetResponse> {
        delegate!(self.get_multi(keys))
    }

    pub async fn set(&mut self, item: &Item) -> MutateResponse {
        delegate!(self.set(item))
    }

    pub async fn set_multi(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        delegate!(self.set_multi(items))
    }

    pub async fn set_sentinels(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        delegate!(self.set_sentinels(items))
    }

    pub async fn add(&mut self, item: &Item) -> MutateResponse {
        delegate!(self.add(item))
    }

    pub async fn add_multi(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        delegate!(self.add_multi(items))
    }

    pub async fn replace(&mut self, item: &Item) -> MutateResponse {
        delegate!(self.replace(item))
    }

    pub async fn delete(&mut self, key: &str) -> MutateResponse {
        delegate!(self.delete(key))
    }

    pub async fn delete_multi<S: AsRef<str>>(&mut self, keys: &[S]) -> Vec<MutateResponse> {
        delegate!(self.delete_multi(keys))
    }

    pub async fn append(&mut self, key: &str, value: Bytes) -> MutateResponse {
        delegate!(self.append(key, value))
    }

    pub async fn prepend(&mut self, key: &str, value: Bytes) -> MutateResponse {
        delegate!(self.prepend(key, value))
    }

    pub async fn increment(
        &mut self,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        delegate!(self.increment(key, delta, init_value, expiration))
    }

    pub async fn decrement(
        &mut self,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        delegate!(self.decrement(key, delta, init_value, expiration))
    }

    pub async fn flush(&mut self, expiration: u32) -> GenericResponse {
        delegate!(self.flush(expiration))
    }

    pub async fn stat(&mut self, stats_key: &str) -> StatResponse {
        delegate!(self.stat(stats_key))
    }

    pub async fn version(&mut self) -> VersionResponse {
        delegate!(self.version())
    }

    pub async fn verbosity(&mut self, verbosity: u32) -> GenericResponse {
        delegate!(self.verbosity(verbosity))
    }
}
