//! ASCII-protocol client for a single connection.
//!
//! Operates on a pre-existing duplex channel through buffered reader and
//! writer halves. After every exchange the client asserts both buffers are
//! fully drained and flushed; residual bytes mean the client and server
//! disagree on framing, which poisons the connection even though the
//! just-completed result is still returned to the caller.
//!
//! Protocol limitations surface as validation errors rather than wire
//! traffic: only `set` can carry a CAS id, counters cannot seed missing
//! keys, and `stats` only supports the default statistics set.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf, split,
};

use shoal_protocol::ascii::{
    self, CounterCommand, CounterReply, DeleteReply, GetLine, StatLine, StoreCommand, StoreReply,
};
use shoal_protocol::{ParseError, ResponseStatus};

use crate::client::{ConnState, Disposition};
use crate::item::{validate_key, validate_value};
use crate::pool::Channel;
use crate::response::{
    CountResponse, GenericResponse, GetResponse, MutateResponse, StatResponse, VersionResponse,
};
use crate::{Error, Item, ShardId};

/// Memcache client speaking the ASCII protocol over one channel.
pub struct RawAsciiClient<C> {
    shard: ShardId,
    reader: BufReader<ReadHalf<C>>,
    writer: BufWriter<WriteHalf<C>>,
    state: ConnState,
}

impl<C: Channel> RawAsciiClient<C> {
    /// Wrap an established channel. `shard` labels version/stat results.
    pub fn new(shard: ShardId, channel: C) -> Self {
        let (reader, writer) = split(channel);
        RawAsciiClient {
            shard,
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
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
        let RawAsciiClient {
            reader,
            writer,
            state,
            ..
        } = self;
        let channel = reader.into_inner().unsplit(writer.into_inner());
        state.dispose(channel)
    }

    // -- Buffered I/O ---------------------------------------------------------

    /// Queue bytes on the write buffer without flushing.
    async fn buffer_write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.state.is_poisoned() {
            return Err(Error::InvalidState);
        }
        if let Err(err) = self.writer.write_all(bytes).await {
            self.state = ConnState::Poisoned;
            return Err(err.into());
        }
        Ok(())
    }

    /// Flush everything queued on the write buffer.
    async fn flush_writer(&mut self) -> Result<(), Error> {
        if self.state.is_poisoned() {
            return Err(Error::InvalidState);
        }
        if let Err(err) = self.writer.flush().await {
            self.state = ConnState::Poisoned;
            return Err(err.into());
        }
        Ok(())
    }

    async fn write_and_flush(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.buffer_write(bytes).await?;
        self.flush_writer().await
    }

    /// Read one `\r\n`-terminated line, without the terminator.
    async fn read_line(&mut self) -> Result<String, Error> {
        if self.state.is_poisoned() {
            return Err(Error::InvalidState);
        }
        let line = self.read_line_inner().await;
        if line.is_err() {
            self.state = ConnState::Poisoned;
        }
        line
    }

    async fn read_line_inner(&mut self) -> Result<String, Error> {
        let mut raw = Vec::new();
        let n = self.reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )
            .into());
        }
        if !raw.ends_with(b"\r\n") {
            return Err(ParseError::MalformedLine(
                String::from_utf8_lossy(&raw).into_owned(),
            )
            .into());
        }
        raw.truncate(raw.len() - 2);
        String::from_utf8(raw).map_err(|err| {
            ParseError::MalformedLine(String::from_utf8_lossy(err.as_bytes()).into_owned()).into()
        })
    }

    /// Read a value block of `len` bytes plus its mandatory `\r\n`.
    async fn read_value(&mut self, len: usize) -> Result<Bytes, Error> {
        if self.state.is_poisoned() {
            return Err(Error::InvalidState);
        }
        let mut buf = vec![0u8; len + 2];
        if let Err(err) = self.reader.read_exact(&mut buf).await {
            self.state = ConnState::Poisoned;
            return Err(err.into());
        }
        if &buf[len..] != b"\r\n" {
            self.state = ConnState::Poisoned;
            return Err(ParseError::CorruptValueTerminator.into());
        }
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Desync check run after every exchange: both buffers must be empty.
    /// A failure poisons the connection but the logical result of the
    /// exchange that just completed is still handed to the caller.
    fn check_empty_buffers(&mut self) -> Result<(), Error> {
        if !self.writer.buffer().is_empty() {
            self.state = ConnState::Poisoned;
            return Err(Error::UnflushedWrite);
        }
        if !self.reader.buffer().is_empty() {
            self.state = ConnState::Poisoned;
            return Err(Error::UndrainedRead);
        }
        Ok(())
    }

    // -- Get ------------------------------------------------------------------

    /// Retrieve a single entry. `KeyNotFound` is reported as a miss, not an
    /// error.
    pub async fn get(&mut self, key: &str) -> GetResponse {
        let mut responses = self.get_multi(&[key]).await;
        match responses.remove(key) {
            Some(resp) => resp,
            None => GetResponse::miss(key),
        }
    }

    /// Batch get. One `gets` command is sent naming each distinct key once;
    /// every requested key gets an entry in the result map.
    pub async fn get_multi<S: AsRef<str>>(&mut self, keys: &[S]) -> HashMap<String, GetResponse> {
        let mut responses: HashMap<String, GetResponse> = HashMap::with_capacity(keys.len());
        let mut needed: Vec<String> = Vec::with_capacity(keys.len());

        for key in keys {
            let key = key.as_ref();
            if responses.contains_key(key) || needed.iter().any(|k| k == key) {
                continue;
            }
            match validate_key(key) {
                Ok(()) => needed.push(key.to_owned()),
                Err(err) => {
                    responses.insert(key.to_owned(), GetResponse::from_error(key, err));
                }
            }
        }
        if needed.is_empty() {
            return responses;
        }

        let mut buf = BytesMut::new();
        let needed_refs: Vec<&str> = needed.iter().map(String::as_str).collect();
        ascii::write_gets(&mut buf, &needed_refs);
        if let Err(err) = self.write_and_flush(&buf).await {
            populate_get_errors(&mut responses, &needed, &err);
            return responses;
        }

        // Any failure from here on terminates the reply stream mid-way;
        // the remaining keys share the error and the connection is gone.
        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(err) => {
                    populate_get_errors(&mut responses, &needed, &err);
                    return responses;
                }
            };

            let header = match GetLine::parse(&line) {
                Ok(GetLine::End) => break,
                Ok(GetLine::Value(header)) => header,
                Err(err) => {
                    self.state = ConnState::Poisoned;
                    populate_get_errors(&mut responses, &needed, &err.into());
                    return responses;
                }
            };

            // The server may only answer with keys we asked for, once each.
            let expected = needed.iter().any(|k| *k == header.key)
                && !responses.contains_key(&header.key);
            if !expected {
                self.state = ConnState::Poisoned;
                let err = Error::Protocol(ParseError::MalformedLine(line));
                populate_get_errors(&mut responses, &needed, &err);
                return responses;
            }

            let value = match self.read_value(header.len).await {
                Ok(value) => value,
                Err(err) => {
                    populate_get_errors(&mut responses, &needed, &err);
                    return responses;
                }
            };
            responses.insert(
                header.key.clone(),
                GetResponse::new(
                    &header.key,
                    ResponseStatus::NoError,
                    header.flags,
                    value,
                    header.cas,
                ),
            );
        }

        if let Err(err) = self.check_empty_buffers() {
            populate_get_errors(&mut responses, &needed, &err);
            return responses;
        }

        for key in needed {
            if !responses.contains_key(&key) {
                let miss = GetResponse::miss(&key);
                responses.insert(key, miss);
            }
        }
        responses
    }

    // -- Stores ---------------------------------------------------------------

    /// Validation performed before any bytes are written for `item`.
    fn store_validation_failure(cmd: StoreCommand, item: &Item) -> Option<MutateResponse> {
        if item.data_version_id != 0 && !cmd.supports_cas() {
            return Some(MutateResponse::from_error(
                &item.key,
                Error::CasUnsupported(cmd.as_str()),
            ));
        }
        if let Err(err) = validate_key(&item.key) {
            return Some(MutateResponse::from_error(&item.key, err));
        }
        if let Err(err) = validate_value(&item.value) {
            return Some(MutateResponse::from_error(&item.key, err));
        }
        None
    }

    /// Pipelined store: every pending command line and value block is
    /// buffered, the writer is flushed once, and the single-token outcomes
    /// are read back in send order.
    async fn store_requests(&mut self, cmd: StoreCommand, items: &[Item]) -> Vec<MutateResponse> {
        let mut responses: Vec<Option<MutateResponse>> = items
            .iter()
            .map(|item| Self::store_validation_failure(cmd, item))
            .collect();

        if responses.iter().all(Option::is_some) {
            return collect_mutates(responses, items);
        }

        for (i, item) in items.iter().enumerate() {
            if responses[i].is_some() {
                continue;
            }
            let mut buf = BytesMut::new();
            ascii::write_store(
                &mut buf,
                cmd,
                &item.key,
                item.flags,
                item.expiration,
                item.data_version_id,
                &item.value,
            );
            if let Err(err) = self.buffer_write(&buf).await {
                populate_mutate_errors(&mut responses, items, &err);
                return collect_mutates(responses, items);
            }
        }
        if let Err(err) = self.flush_writer().await {
            populate_mutate_errors(&mut responses, items, &err);
            return collect_mutates(responses, items);
        }

        for (i, item) in items.iter().enumerate() {
            if responses[i].is_some() {
                continue;
            }
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(err) => {
                    populate_mutate_errors(&mut responses, items, &err);
                    return collect_mutates(responses, items);
                }
            };
            // The ASCII store replies carry no CAS, so the version id of a
            // successful store is always reported as zero.
            responses[i] = Some(match StoreReply::parse(&line) {
                Some(StoreReply::Stored) => {
                    MutateResponse::new(&item.key, ResponseStatus::NoError, 0)
                }
                Some(StoreReply::NotFound) => {
                    MutateResponse::new(&item.key, ResponseStatus::KeyNotFound, 0)
                }
                Some(StoreReply::NotStored) => {
                    MutateResponse::new(&item.key, ResponseStatus::ItemNotStored, 0)
                }
                Some(StoreReply::Exists) => {
                    MutateResponse::new(&item.key, ResponseStatus::KeyExists, 0)
                }
                None => MutateResponse::from_error(&item.key, Error::Server(line)),
            });
        }

        let _ = self.check_empty_buffers();
        collect_mutates(responses, items)
    }

    /// Store an entry. A nonzero `data_version_id` switches to the `cas`
    /// command.
    pub async fn set(&mut self, item: &Item) -> MutateResponse {
        single_mutate(
            self.store_requests(StoreCommand::Set, std::slice::from_ref(item))
                .await,
            &item.key,
        )
    }

    /// Pipelined batch [`set`](Self::set); responses are in input order.
    pub async fn set_multi(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        self.store_requests(StoreCommand::Set, items).await
    }

    /// On a raw client sentinels are plain sets; the warming-up override
    /// happens in the sharded layer.
    pub async fn set_sentinels(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        self.set_multi(items).await
    }

    /// Store an entry only if the key does not exist yet.
    pub async fn add(&mut self, item: &Item) -> MutateResponse {
        single_mutate(
            self.store_requests(StoreCommand::Add, std::slice::from_ref(item))
                .await,
            &item.key,
        )
    }

    /// Pipelined batch [`add`](Self::add).
    pub async fn add_multi(&mut self, items: &[Item]) -> Vec<MutateResponse> {
        self.store_requests(StoreCommand::Add, items).await
    }

    /// Store an entry only if the key already exists.
    pub async fn replace(&mut self, item: &Item) -> MutateResponse {
        single_mutate(
            self.store_requests(StoreCommand::Replace, std::slice::from_ref(item))
                .await,
            &item.key,
        )
    }

    /// Append bytes to an existing entry's value.
    pub async fn append(&mut self, key: &str, value: Bytes) -> MutateResponse {
        let item = Item::new(key, value);
        single_mutate(
            self.store_requests(StoreCommand::Append, std::slice::from_ref(&item))
                .await,
            key,
        )
    }

    /// Prepend bytes to an existing entry's value.
    pub async fn prepend(&mut self, key: &str, value: Bytes) -> MutateResponse {
        let item = Item::new(key, value);
        single_mutate(
            self.store_requests(StoreCommand::Prepend, std::slice::from_ref(&item))
                .await,
            key,
        )
    }

    // -- Deletes --------------------------------------------------------------

    /// Remove an entry.
    pub async fn delete(&mut self, key: &str) -> MutateResponse {
        single_mutate(self.delete_multi(&[key]).await, key)
    }

    /// Pipelined batch [`delete`](Self::delete); responses in input order.
    pub async fn delete_multi<S: AsRef<str>>(&mut self, keys: &[S]) -> Vec<MutateResponse> {
        let mut responses: Vec<Option<MutateResponse>> = Vec::with_capacity(keys.len());

        for key in keys {
            let key = key.as_ref();
            match validate_key(key) {
                Ok(()) => {
                    let mut buf = BytesMut::new();
                    ascii::write_delete(&mut buf, key);
                    match self.buffer_write(&buf).await {
                        Ok(()) => responses.push(None),
                        Err(err) => responses.push(Some(MutateResponse::from_error(key, err))),
                    }
                }
                Err(err) => responses.push(Some(MutateResponse::from_error(key, err))),
            }
        }

        if let Err(err) = self.flush_writer().await {
            // The deletes may or may not have reached the server.
            for (i, key) in keys.iter().enumerate() {
                if responses[i].is_none() {
                    responses[i] = Some(MutateResponse::from_error(key.as_ref(), err.clone()));
                }
            }
        }

        let mut out = Vec::with_capacity(keys.len());
        for (resp, key) in responses.into_iter().zip(keys) {
            let key = key.as_ref();
            let resp = match resp {
                Some(resp) => resp,
                None => match self.read_line().await {
                    Ok(line) => match DeleteReply::parse(&line) {
                        Some(DeleteReply::Deleted) => {
                            MutateResponse::new(key, ResponseStatus::NoError, 0)
                        }
                        Some(DeleteReply::NotFound) => {
                            MutateResponse::new(key, ResponseStatus::KeyNotFound, 0)
                        }
                        None => MutateResponse::from_error(key, Error::Server(line)),
                    },
                    Err(err) => MutateResponse::from_error(key, err),
                },
            };
            out.push(resp);
        }

        let _ = self.check_empty_buffers();
        out
    }

    // -- Counters -------------------------------------------------------------

    async fn count_op(
        &mut self,
        cmd: CounterCommand,
        key: &str,
        delta: u64,
        expiration: u32,
    ) -> CountResponse {
        // The ASCII counter commands cannot seed a missing key; only the
        // "fail on miss" expiration sentinel is expressible.
        if expiration != 0xffffffff {
            return CountResponse::from_error(key, Error::CounterSeedUnsupported);
        }
        if let Err(err) = validate_key(key) {
            return CountResponse::from_error(key, err);
        }

        let mut buf = BytesMut::new();
        ascii::write_counter(&mut buf, cmd, key, delta);
        if let Err(err) = self.write_and_flush(&buf).await {
            return CountResponse::from_error(key, err);
        }

        let line = match self.read_line().await {
            Ok(line) => line,
            Err(err) => return CountResponse::from_error(key, err),
        };
        let _ = self.check_empty_buffers();

        match CounterReply::parse(&line) {
            Ok(CounterReply::NotFound) => {
                CountResponse::new(key, ResponseStatus::KeyNotFound, 0)
            }
            Ok(CounterReply::Value(count)) => {
                CountResponse::new(key, ResponseStatus::NoError, count)
            }
            Err(_) => CountResponse::from_error(key, Error::Server(line)),
        }
    }

    /// Add `delta` to the key's counter. `expiration` must be `0xffffffff`;
    /// `init_value` cannot be expressed on this protocol and is ignored.
    pub async fn increment(
        &mut self,
        key: &str,
        delta: u64,
        _init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        self.count_op(CounterCommand::Incr, key, delta, expiration)
            .await
    }

    /// Subtract `delta` from the key's counter; the counter floors at zero.
    /// The same expiration restriction as [`increment`](Self::increment)
    /// applies.
    pub async fn decrement(
        &mut self,
        key: &str,
        delta: u64,
        _init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        self.count_op(CounterCommand::Decr, key, delta, expiration)
            .await
    }

    // -- Fleet / admin --------------------------------------------------------

    /// Send one command line and expect a bare `OK` back.
    async fn ok_op(&mut self, buf: &[u8]) -> GenericResponse {
        if let Err(err) = self.write_and_flush(buf).await {
            return GenericResponse::from_error(err);
        }
        let line = match self.read_line().await {
            Ok(line) => line,
            Err(err) => return GenericResponse::from_error(err),
        };
        let _ = self.check_empty_buffers();

        if line == ascii::OK {
            GenericResponse::new(ResponseStatus::NoError)
        } else {
            GenericResponse::from_error(Error::Server(line))
        }
    }

    /// Invalidate every entry `expiration` seconds from now (0 = now).
    pub async fn flush(&mut self, expiration: u32) -> GenericResponse {
        let mut buf = BytesMut::new();
        ascii::write_flush_all(&mut buf, expiration);
        self.ok_op(&buf).await
    }

    /// Set the server's logging verbosity.
    pub async fn verbosity(&mut self, verbosity: u32) -> GenericResponse {
        let mut buf = BytesMut::new();
        ascii::write_verbosity(&mut buf, verbosity);
        self.ok_op(&buf).await
    }

    /// Fetch server statistics. Only the default set (`stats_key == ""`)
    /// can be requested on this protocol.
    pub async fn stat(&mut self, stats_key: &str) -> StatResponse {
        let mut entries: HashMap<String, String> = HashMap::new();

        if !stats_key.is_empty() {
            return StatResponse::from_error(
                Error::KeyedStatsUnsupported,
                shard_entries(self.shard, entries),
            );
        }

        let mut buf = BytesMut::new();
        ascii::write_stats(&mut buf);
        if let Err(err) = self.write_and_flush(&buf).await {
            return StatResponse::from_error(err, shard_entries(self.shard, entries));
        }

        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(err) => {
                    return StatResponse::from_error(err, shard_entries(self.shard, entries));
                }
            };
            match StatLine::parse(&line) {
                Ok(StatLine::End) => break,
                Ok(StatLine::Entry { key, value }) => {
                    entries.insert(key, value);
                }
                Err(err) => {
                    // Exiting the stats stream mid-way leaves unread
                    // entries on the wire.
                    self.state = ConnState::Poisoned;
                    return StatResponse::from_error(
                        err.into(),
                        shard_entries(self.shard, entries),
                    );
                }
            }
        }

        let _ = self.check_empty_buffers();
        StatResponse::new(ResponseStatus::NoError, shard_entries(self.shard, entries))
    }

    /// Fetch the server's version string.
    pub async fn version(&mut self) -> VersionResponse {
        let mut versions = HashMap::new();

        let mut buf = BytesMut::new();
        ascii::write_version(&mut buf);
        if let Err(err) = self.write_and_flush(&buf).await {
            return VersionResponse::from_error(err, versions);
        }
        let line = match self.read_line().await {
            Ok(line) => line,
            Err(err) => return VersionResponse::from_error(err, versions),
        };
        let _ = self.check_empty_buffers();

        match ascii::parse_version_line(&line) {
            Some(version) => {
                versions.insert(self.shard, version.to_owned());
                VersionResponse::new(ResponseStatus::NoError, versions)
            }
            None => VersionResponse::from_error(Error::Server(line), versions),
        }
    }
}

/// Fill every not-yet-answered key of a get batch with the same error.
fn populate_get_errors(
    responses: &mut HashMap<String, GetResponse>,
    needed: &[String],
    err: &Error,
) {
    for key in needed {
        if !responses.contains_key(key) {
            responses.insert(key.clone(), GetResponse::from_error(key, err.clone()));
        }
    }
}

/// Fill every not-yet-answered entry of a mutation batch with the same
/// error.
fn populate_mutate_errors(
    responses: &mut [Option<MutateResponse>],
    items: &[Item],
    err: &Error,
) {
    for (resp, item) in responses.iter_mut().zip(items) {
        if resp.is_none() {
            *resp = Some(MutateResponse::from_error(&item.key, err.clone()));
        }
    }
}

/// Finalize a mutation batch; by this point every slot has been filled.
fn collect_mutates(responses: Vec<Option<MutateResponse>>, items: &[Item]) -> Vec<MutateResponse> {
    responses
        .into_iter()
        .zip(items)
        .map(|(resp, item)| {
            resp.unwrap_or_else(|| MutateResponse::from_error(&item.key, Error::InvalidState))
        })
        .collect()
}

fn single_mutate(mut responses: Vec<MutateResponse>, key: &str) -> MutateResponse {
    if responses.is_empty() {
        return MutateResponse::from_error(key, Error::InvalidState);
    }
    responses.swap_remove(0)
}

fn shard_entries(
    shard: ShardId,
    entries: HashMap<String, String>,
) -> HashMap<ShardId, HashMap<String, String>> {
    let mut map = HashMap::with_capacity(1);
    map.insert(shard, entries);
    map
}
