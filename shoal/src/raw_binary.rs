//! Binary-protocol client for a single connection.
//!
//! Operates on a pre-existing duplex channel; the caller sets the channel
//! up and decides, via [`finish`](RawBinaryClient::finish), whether to
//! return it to a pool or drop it. The client assumes nothing else reads or
//! writes on the channel. Methods take `&mut self`, so all operations on
//! one connection are serialized by construction; open more channels for
//! parallelism.

use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use shoal_protocol::binary::{self, HEADER_SIZE, ResponseHeader};
use shoal_protocol::{Opcode, ParseError, ResponseStatus};

use crate::client::{ConnState, Disposition};
use crate::item::{validate_key, validate_value};
use crate::pool::Channel;
use crate::response::{
    CountResponse, GenericResponse, GetResponse, MutateResponse, StatResponse, VersionResponse,
};
use crate::{Error, Item, ShardId};

/// One fully-read response frame.
struct Frame {
    status: ResponseStatus,
    cas: u64,
    extras: Bytes,
    key: Bytes,
    value: Bytes,
}

/// Memcache client speaking the binary protocol over one channel.
pub struct RawBinaryClient<C> {
    shard: ShardId,
    channel: C,
    state: ConnState,
}

impl<C: Channel> RawBinaryClient<C> {
    /// Wrap an established channel. `shard` labels version/stat results.
    pub fn new(shard: ShardId, channel: C) -> Self {
        RawBinaryClient {
            shard,
            channel,
            state: ConnState::Healthy,
        }
    }

    /// The shard id this client was built for.
    pub fn shard_id(&self) -> ShardId {
        self.shard
    }

    /// False once a transport or protocol failure has poisoned the
    /// connection; it never becomes true again.
    pub fn is_valid_state(&self) -> bool {
        self.state.is_healthy()
    }

    /// Consume the client and recover the channel, tagged with whether it
    /// is safe to reuse.
    pub fn finish(self) -> Disposition<C> {
        self.state.dispose(self.channel)
    }

    // -- Framing --------------------------------------------------------------

    /// Serialize and send one request. Any failure poisons the connection.
    async fn send_request(
        &mut self,
        opcode: Opcode,
        cas: u64,
        key: &[u8],
        value: &[u8],
        extras: &[u8],
    ) -> Result<(), Error> {
        if self.state.is_poisoned() {
            return Err(Error::InvalidState);
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + extras.len() + key.len() + value.len());
        binary::encode_request(&mut buf, opcode, cas, key, value, extras);

        let sent = async {
            self.channel.write_all(&buf).await?;
            self.channel.flush().await?;
            Ok::<(), Error>(())
        }
        .await;

        if sent.is_err() {
            self.state = ConnState::Poisoned;
        }
        sent
    }

    /// Read one response frame for the operation that was sent. Any failure
    /// poisons the connection.
    async fn receive_frame(&mut self, expected: Opcode) -> Result<Frame, Error> {
        if self.state.is_poisoned() {
            return Err(Error::InvalidState);
        }
        let frame = self.read_frame(expected).await;
        if frame.is_err() {
            self.state = ConnState::Poisoned;
        }
        frame
    }

    async fn read_frame(&mut self, expected: Opcode) -> Result<Frame, Error> {
        let mut header = [0u8; HEADER_SIZE];
        self.channel.read_exact(&mut header).await?;
        let header = ResponseHeader::parse(&header)?;

        if header.opcode != expected {
            return Err(ParseError::UnexpectedOpcode {
                expected: expected as u8,
                found: header.opcode as u8,
            }
            .into());
        }
        let value_len = header.value_length()?;

        let mut extras = vec![0u8; header.extras_length as usize];
        self.channel.read_exact(&mut extras).await?;
        let mut key = vec![0u8; header.key_length as usize];
        self.channel.read_exact(&mut key).await?;
        let mut value = vec![0u8; value_len];
        self.channel.read_exact(&mut value).await?;

        Ok(Frame {
            status: header.status,
            cas: header.cas,
            extras: extras.into(),
            key: key.into(),
            value: value.into(),
        })
    }

    /// The supported operations other than get carry no response extras;
    /// leftovers mean the framing is no longer trustworthy.
    fn expect_no_extras(&mut self, frame: &Frame) -> Result<(), Error> {
        if frame.extras.is_empty() {
            Ok(())
        } else {
            self.state = ConnState::Poisoned;
            Err(ParseError::TrailingExtras(frame.extras.len()).into())
        }
    }

    // -- Get ------------------------------------------------------------------

    async fn send_get(&mut self, key: &str) -> Option<GetResponse> {
        if let Err(err) = validate_key(key) {
            return Some(GetResponse::from_error(key, err));
        }
        match self.send_request(Opcode::Get, 0, key.as_bytes(), &[], &[]).await {
            Ok(()) => None,
            Err(err) => Some(GetResponse::from_error(key, err)),
        }
    }

    async fn receive_get(&mut self, key: &str) -> GetResponse {
        let frame = match self.receive_frame(Opcode::Get).await {
            Ok(frame) => frame,
            Err(err) => return GetResponse::from_error(key, err),
        };

        // A hit must carry the 4-byte flags extras; an error status is
        // allowed to omit them.
        let flags = if frame.extras.is_empty() {
            if frame.status.is_success() {
                self.state = ConnState::Poisoned;
                return GetResponse::from_error(key, ParseError::MissingExtras.into());
            }
            0
        } else {
            match binary::parse_flags_extras(&frame.extras) {
                Ok(flags) => flags,
                Err(err) => {
                    self.state = ConnState::Poisoned;
                    return GetResponse::from_error(key, err.into());
                }
            }
        };

        GetResponse::new(key, frame.status, flags, frame.value, frame.cas)
    }

    /// Retrieve a single entry. `KeyNotFound` is reported as a miss, not an
    /// error.
    pub async fn get(&mut self, key: &str) -> GetResponse {
        match self.send_get(key).await {
            Some(early) => early,
            None => self.receive_get(key).await,
        }
    }

    /// Batch get: all requests are pipelined before any response is read,
    /// and responses are read in send order. Duplicate keys are sent once.
    pub async fn get_multi<S: AsRef<str>>(&mut self, keys: &[S]) -> HashMap<String, GetResponse> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut distinct: Vec<&str> = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.as_ref();
            if seen.insert(key) {
                distinct.push(key);
            }
        }

        let mut early: Vec<Option<GetResponse>> = Vec::with_capacity(distinct.len());
        for key in &distinct {
            early.push(self.send_get(key).await);
        }

        let mut responses = HashMap::with_capacity(distinct.len());
        for (sent, key) in early.into_iter().zip(&distinct) {
            let resp = match sent {
                Some(resp) => resp,
                None => self.receive_get(key).await,
            };
            responses.insert((*key).to_owned(), resp);
        }
        responses
    }

    // -- Mutations ------------------------------------------------------------

    async fn send_mutate(
        &mut self,
        opcode: Opcode,
        item: &Item,
        with_extras: bool,
    ) -> Option<MutateResponse> {
        if let Err(err) = validate_key(&item.key) {
            return Some(MutateResponse::from_error(&item.key, err));
        }
        if let Err(err) = validate_value(&item.value) {
            return Some(MutateResponse::from_error(&item.key, err));
        }

        let extras = if with_extras {
            binary::store_extras(item.flags, item.expiration).to_vec()
        } else {
            Vec::new()
        };
        let sent = self
            .send_request(
                opcode,
                item.data_version_id,
                item.key.as_bytes(),
                &item.value,
                &extras,
            )
            .await;
        match sent {
            Ok(()) => None,
            Err(err) => Some(MutateResponse::from_error(&item.key, err)),
        }
    }

    async fn receive_mutate(&mut self, opcode: Opcode, key: &str) -> MutateResponse {
        match self.receive_frame(opcode).await {
            Ok(frame) => match self.expect_no_extras(&frame) {
                Ok(()) => MutateResponse::new(key, frame.status, frame.cas),
                Err(err) => MutateResponse::from_error(key, err),
            },
            Err(err) => MutateResponse::from_error(key, err),
        }
    }

    async fn mutate(&mut self, opcode: Opcode, item: &Item) -> MutateResponse {
        match self.send_mutate(opcode, item, true).await {
            Some(early) => early,
            None => self.receive_mutate(opcode, &item.key).await,
        }
    }

    async fn mutate_multi(&mut self, opcode: Opcode, items: &[Item]) -> Vec<MutateResponse> {
        let mut early: Vec<Option<MutateResponse>> = Vec::with_capacity(items.len());
        for item in items {
            early.push(self.send_mutate(opcode, item, true).await);
        }

        let mut responses = Vec::with_capacity(items.len());
        for (sent, item) in early.into_iter().zip(items) {
            let resp = match sent {
                Some(resp) => resp,
                None => self.receive_mutate(opcode, &item.key).await,
            };
            responses.push(resp);
        }
        responses
    }

    /// Store an entry. A nonzero `data_version_id` makes this a CAS store:
    /// it succeeds only while the server-side entry still has that version.
    pub async fn set(&mut self, item: &Item) -> MutateResponse {
        self.mutate(Opcode::Set, item).await
    }

    /// Pipelined batch [`set`](Self::set); responses are in input order.
    pub async fn set_multi(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        self.mutate_multi(Opcode::Set, items).await
    }

    /// On a raw client sentinels are plain sets; the warming-up override
    /// happens in the sharded layer.
    pub async fn set_sentinels(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        self.set_multi(items).await
    }

    /// Store an entry only if the key does not exist yet.
    pub async fn add(&mut self, item: &Item) -> MutateResponse {
        self.mutate(Opcode::Add, item).await
    }

    /// Pipelined batch [`add`](Self::add).
    pub async fn add_multi(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        self.mutate_multi(Opcode::Add, items).await
    }

    /// Store an entry only if the key already exists.
    pub async fn replace(&mut self, item: &Item) -> MutateResponse {
        self.mutate(Opcode::Replace, item).await
    }

    async fn send_delete(&mut self, key: &str) -> Option<MutateResponse> {
        if let Err(err) = validate_key(key) {
            return Some(MutateResponse::from_error(key, err));
        }
        match self.send_request(Opcode::Delete, 0, key.as_bytes(), &[], &[]).await {
            Ok(()) => None,
            Err(err) => Some(MutateResponse::from_error(key, err)),
        }
    }

    /// Remove an entry.
    pub async fn delete(&mut self, key: &str) -> MutateResponse {
        match self.send_delete(key).await {
            Some(early) => early,
            None => self.receive_mutate(Opcode::Delete, key).await,
        }
    }

    /// Pipelined batch [`delete`](Self::delete); responses in input order.
    pub async fn delete_multi<S: AsRef<str>>(&mut self, keys: &[S]) -> Vec<MutateResponse> {
        let mut early: Vec<Option<MutateResponse>> = Vec::with_capacity(keys.len());
        for key in keys {
            early.push(self.send_delete(key.as_ref()).await);
        }

        let mut responses = Vec::with_capacity(keys.len());
        for (sent, key) in early.into_iter().zip(keys) {
            let resp = match sent {
                Some(resp) => resp,
                None => self.receive_mutate(Opcode::Delete, key.as_ref()).await,
            };
            responses.push(resp);
        }
        responses
    }

    /// Append bytes to an existing entry's value.
    pub async fn append(&mut self, key: &str, value: Bytes) -> MutateResponse {
        let item = Item::new(key, value);
        match self.send_mutate(Opcode::Append, &item, false).await {
            Some(early) => early,
            None => self.receive_mutate(Opcode::Append, key).await,
        }
    }

    /// Prepend bytes to an existing entry's value.
    pub async fn prepend(&mut self, key: &str, value: Bytes) -> MutateResponse {
        let item = Item::new(key, value);
        match self.send_mutate(Opcode::Prepend, &item, false).await {
            Some(early) => early,
            None => self.receive_mutate(Opcode::Prepend, key).await,
        }
    }

    // -- Counters -------------------------------------------------------------

    async fn count_op(
        &mut self,
        opcode: Opcode,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        if let Err(err) = validate_key(key) {
            return CountResponse::from_error(key, err);
        }

        let extras = binary::counter_extras(delta, init_value, expiration);
        if let Err(err) = self
            .send_request(opcode, 0, key.as_bytes(), &[], &extras)
            .await
        {
            return CountResponse::from_error(key, err);
        }

        let frame = match self.receive_frame(opcode).await {
            Ok(frame) => frame,
            Err(err) => return CountResponse::from_error(key, err),
        };
        if let Err(err) = self.expect_no_extras(&frame) {
            return CountResponse::from_error(key, err);
        }
        if !frame.status.is_success() {
            return CountResponse::new(key, frame.status, 0);
        }
        match binary::parse_counter_value(&frame.value) {
            Ok(count) => CountResponse::new(key, frame.status, count),
            Err(err) => CountResponse::from_error(key, err.into()),
        }
    }

    /// Add `delta` to the key's counter. With `expiration == 0xffffffff` a
    /// missing counter fails with `KeyNotFound`; any other expiration seeds
    /// it with `init_value`.
    pub async fn increment(
        &mut self,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        self.count_op(Opcode::Increment, key, delta, init_value, expiration)
            .await
    }

    /// Subtract `delta` from the key's counter; the counter floors at zero.
    /// Seeding behaves as in [`increment`](Self::increment).
    pub async fn decrement(
        &mut self,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        self.count_op(Opcode::Decrement, key, delta, init_value, expiration)
            .await
    }

    // -- Fleet / admin --------------------------------------------------------

    async fn generic_op(&mut self, opcode: Opcode, extras: &[u8]) -> GenericResponse {
        if let Err(err) = self.send_request(opcode, 0, &[], &[], extras).await {
            return GenericResponse::from_error(err);
        }
        match self.receive_frame(opcode).await {
            Ok(frame) => match self.expect_no_extras(&frame) {
                Ok(()) => GenericResponse::new(frame.status),
                Err(err) => GenericResponse::from_error(err),
            },
            Err(err) => GenericResponse::from_error(err),
        }
    }

    /// Invalidate every entry `expiration` seconds from now (0 = now).
    pub async fn flush(&mut self, expiration: u32) -> GenericResponse {
        self.generic_op(Opcode::Flush, &binary::u32_extras(expiration))
            .await
    }

    /// Set the server's logging verbosity.
    pub async fn verbosity(&mut self, verbosity: u32) -> GenericResponse {
        self.generic_op(Opcode::Verbosity, &binary::u32_extras(verbosity))
            .await
    }

    /// Fetch server statistics. An empty `stats_key` selects the default
    /// statistics set.
    pub async fn stat(&mut self, stats_key: &str) -> StatResponse {
        let mut entries: HashMap<String, String> = HashMap::new();

        if let Err(err) = validate_key(stats_key) {
            return StatResponse::from_error(err, shard_entries(self.shard, entries));
        }
        if let Err(err) = self
            .send_request(Opcode::Stat, 0, stats_key.as_bytes(), &[], &[])
            .await
        {
            return StatResponse::from_error(err, shard_entries(self.shard, entries));
        }

        loop {
            let frame = match self.receive_frame(Opcode::Stat).await {
                Ok(frame) => frame,
                Err(err) => {
                    return StatResponse::from_error(err, shard_entries(self.shard, entries));
                }
            };
            if let Err(err) = self.expect_no_extras(&frame) {
                return StatResponse::from_error(err, shard_entries(self.shard, entries));
            }
            if !frame.status.is_success() {
                // The stream position after a mid-stat error status is
                // unknowable, so the connection cannot be reused.
                self.state = ConnState::Poisoned;
                return StatResponse::new(frame.status, shard_entries(self.shard, entries));
            }
            if frame.key.is_empty() && frame.value.is_empty() {
                break;
            }
            entries.insert(
                String::from_utf8_lossy(&frame.key).into_owned(),
                String::from_utf8_lossy(&frame.value).into_owned(),
            );
        }

        StatResponse::new(ResponseStatus::NoError, shard_entries(self.shard, entries))
    }

    /// Fetch the server's version string.
    pub async fn version(&mut self) -> VersionResponse {
        let mut versions = HashMap::new();

        if let Err(err) = self.send_request(Opcode::Version, 0, &[], &[], &[]).await {
            return VersionResponse::from_error(err, versions);
        }
        match self.receive_frame(Opcode::Version).await {
            Ok(frame) => match self.expect_no_extras(&frame) {
                Ok(()) => {
                    versions.insert(
                        self.shard,
                        String::from_utf8_lossy(&frame.value).into_owned(),
                    );
                    VersionResponse::new(frame.status, versions)
                }
                Err(err) => VersionResponse::from_error(err, versions),
            },
            Err(err) => VersionResponse::from_error(err, versions),
        }
    }
}

fn shard_entries(
    shard: ShardId,
    entries: HashMap<String, String>,
) -> HashMap<ShardId, HashMap<String, String>> {
    let mut map = HashMap::with_capacity(1);
    map.insert(shard, entries);
    map
}
