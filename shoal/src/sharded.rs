//! Sharded client: routes operations across the fleet and merges results.
//!
//! Single-key operations resolve their shard, borrow a connection, run a
//! transient [`RawClient`] over it, and hand the channel back to the pool:
//! released when the client finished healthy, discarded otherwise. Batched
//! operations scatter one task per shard grouping and gather every task's
//! results before returning; one slow shard delays the whole batch, and
//! deadlines belong to the connections underneath, not to this layer.
//!
//! There is no retry here. A key with no shard or no connection produces a
//! synthetic per-key result instead of failing the rest of its batch.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, error};

use shoal_protocol::ResponseStatus;

use crate::client::{Disposition, Protocol, RawClient};
use crate::pool::{Channel, PoolConn};
use crate::response::{
    CountResponse, GenericResponse, GetResponse, MutateResponse, StatResponse, VersionResponse,
};
use crate::topology::{ShardManager, ShardMapping};
use crate::{Error, Item, ShardId, UNMAPPED_SHARD};

/// Which mutation a batched fan-out runs on each shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMutate {
    Set,
    Add,
    /// Like `Set`, but failures against warming-up shards are masked.
    Sentinel,
}

/// Which mutation a single-key call delegates to the raw client.
#[derive(Debug, Clone, Copy)]
enum SingleMutate {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// Resolution outcome for a single-key operation.
enum Resolved {
    /// The key hashes to no shard.
    Unmapped,
    /// The shard is known but producing a connection failed.
    Failed(Error),
    /// The shard is known but not in a routable state; callers get a
    /// synthetic default result.
    NotConnected,
    /// A live client over a borrowed connection.
    Connected(String, RawClient<Box<dyn Channel>>),
}

/// A memcache client that fans operations out across a shard fleet.
///
/// Cheap to clone; clones share the topology manager.
#[derive(Clone)]
pub struct ShardedClient {
    manager: Arc<ShardManager>,
    protocol: Protocol,
}

impl ShardedClient {
    /// A sharded client speaking `protocol` to every shard `manager` knows.
    pub fn new(manager: Arc<ShardManager>, protocol: Protocol) -> Self {
        ShardedClient { manager, protocol }
    }

    /// The topology manager backing this client.
    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    async fn resolve(&self, key: &str) -> Resolved {
        let lookup = self.manager.get_shard(key).await;
        if lookup.shard == UNMAPPED_SHARD {
            return Resolved::Unmapped;
        }
        let shard_addr = lookup.address.unwrap_or_default();
        if let Some(err) = lookup.conn_err {
            return Resolved::Failed(connection_error(&shard_addr, Some(err)));
        }
        match lookup.connection {
            Some(PoolConn { addr, channel }) => {
                Resolved::Connected(addr, RawClient::new(self.protocol, lookup.shard, channel))
            }
            None => Resolved::NotConnected,
        }
    }

    // -- Single-key operations ------------------------------------------------

    /// Retrieve a single entry.
    pub async fn get(&self, key: &str) -> GetResponse {
        match self.resolve(key).await {
            Resolved::Unmapped => GetResponse::from_error(key, Error::NoShard(key.to_owned())),
            Resolved::Failed(err) => GetResponse::from_error(key, err),
            Resolved::NotConnected => GetResponse::miss(key),
            Resolved::Connected(addr, mut client) => {
                let resp = client.get(key).await;
                dispose(&self.manager, addr, client).await;
                resp
            }
        }
    }

    /// Store an entry on its owning shard.
    pub async fn set(&self, item: &Item) -> MutateResponse {
        self.mutate_one(item.clone(), SingleMutate::Set).await
    }

    /// Store an entry only if its key does not exist yet.
    pub async fn add(&self, item: &Item) -> MutateResponse {
        self.mutate_one(item.clone(), SingleMutate::Add).await
    }

    /// Store an entry only if its key already exists.
    pub async fn replace(&self, item: &Item) -> MutateResponse {
        self.mutate_one(item.clone(), SingleMutate::Replace).await
    }

    /// Append bytes to an existing entry's value.
    pub async fn append(&self, key: &str, value: Bytes) -> MutateResponse {
        self.mutate_one(Item::new(key, value), SingleMutate::Append)
            .await
    }

    /// Prepend bytes to an existing entry's value.
    pub async fn prepend(&self, key: &str, value: Bytes) -> MutateResponse {
        self.mutate_one(Item::new(key, value), SingleMutate::Prepend)
            .await
    }

    /// Remove an entry from its owning shard.
    pub async fn delete(&self, key: &str) -> MutateResponse {
        match self.resolve(key).await {
            Resolved::Unmapped => MutateResponse::from_error(key, Error::NoShard(key.to_owned())),
            Resolved::Failed(err) => MutateResponse::from_error(key, err),
            Resolved::NotConnected => MutateResponse::new(key, ResponseStatus::NoError, 0),
            Resolved::Connected(addr, mut client) => {
                let resp = client.delete(key).await;
                dispose(&self.manager, addr, client).await;
                resp
            }
        }
    }

    async fn mutate_one(&self, item: Item, op: SingleMutate) -> MutateResponse {
        let key = item.key.clone();
        match self.resolve(&key).await {
            Resolved::Unmapped => MutateResponse::from_error(&key, Error::NoShard(key.clone())),
            Resolved::Failed(err) => MutateResponse::from_error(&key, err),
            // No routable shard: report success with the zero version id.
            Resolved::NotConnected => MutateResponse::new(&key, ResponseStatus::NoError, 0),
            Resolved::Connected(addr, mut client) => {
                let resp = match op {
                    SingleMutate::Set => client.set(&item).await,
                    SingleMutate::Add => client.add(&item).await,
                    SingleMutate::Replace => client.replace(&item).await,
                    SingleMutate::Append => client.append(&item.key, item.value.clone()).await,
                    SingleMutate::Prepend => client.prepend(&item.key, item.value.clone()).await,
                };
                dispose(&self.manager, addr, client).await;
                resp
            }
        }
    }

    /// Add `delta` to a counter on its owning shard.
    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        match self.resolve(key).await {
            Resolved::Unmapped => CountResponse::from_error(key, Error::NoShard(key.to_owned())),
            Resolved::Failed(err) => CountResponse::from_error(key, err),
            Resolved::NotConnected => CountResponse::new(key, ResponseStatus::NoError, 0),
            Resolved::Connected(addr, mut client) => {
                let resp = client.increment(key, delta, init_value, expiration).await;
                dispose(&self.manager, addr, client).await;
                resp
            }
        }
    }

    /// Subtract `delta` from a counter on its owning shard.
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        init_value: u64,
        expiration: u32,
    ) -> CountResponse {
        match self.resolve(key).await {
            Resolved::Unmapped => CountResponse::from_error(key, Error::NoShard(key.to_owned())),
            Resolved::Failed(err) => CountResponse::from_error(key, err),
            Resolved::NotConnected => CountResponse::new(key, ResponseStatus::NoError, 0),
            Resolved::Connected(addr, mut client) => {
                let resp = client.decrement(key, delta, init_value, expiration).await;
                dispose(&self.manager, addr, client).await;
                resp
            }
        }
    }

    // -- Batched operations ---------------------------------------------------

    /// Batch get across shards. One task runs per shard; results from all
    /// shards are merged into one map keyed by the original keys.
    pub async fn get_multi<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, GetResponse> {
        let mappings = self.manager.get_shards_for_keys(keys).await;

        let mut tasks = JoinSet::new();
        for (shard, mapping) in mappings {
            let manager = Arc::clone(&self.manager);
            let protocol = self.protocol;
            tasks.spawn(async move { get_multi_shard(manager, protocol, shard, mapping).await });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(map) => results.extend(map),
                Err(err) => error!(error = %err, "get_multi shard task failed"),
            }
        }
        results
    }

    /// Batch set across shards. Response order across shards is undefined;
    /// within one shard it follows the input order.
    pub async fn set_multi(&self, items: &[Item]) -> Vec<MutateResponse> {
        let mappings = self.manager.get_shards_for_items(items).await;
        self.run_mutate_batch(mappings, BatchMutate::Set).await
    }

    /// Batch add across shards.
    pub async fn add_multi(&self, items: &[Item]) -> Vec<MutateResponse> {
        let mappings = self.manager.get_shards_for_items(items).await;
        self.run_mutate_batch(mappings, BatchMutate::Add).await
    }

    /// Sentinel variant of [`set_multi`](ShardedClient::set_multi): also
    /// writes to WriteOnly and WarmUp shards, and failures against a
    /// warming-up shard are reported as success so a shard joining the
    /// fleet can absorb writes without surfacing errors.
    pub async fn set_sentinels(&self, items: &[Item]) -> Vec<MutateResponse> {
        let mappings = self.manager.get_shards_for_sentinels(items).await;
        self.run_mutate_batch(mappings, BatchMutate::Sentinel).await
    }

    /// Batch delete across shards.
    pub async fn delete_multi<S: AsRef<str>>(&self, keys: &[S]) -> Vec<MutateResponse> {
        let mappings = self.manager.get_shards_for_keys(keys).await;

        let mut tasks = JoinSet::new();
        for (shard, mapping) in mappings {
            let manager = Arc::clone(&self.manager);
            let protocol = self.protocol;
            tasks.spawn(async move { delete_multi_shard(manager, protocol, shard, mapping).await });
        }
        self.gather_mutates(tasks).await
    }

    async fn run_mutate_batch(
        &self,
        mappings: HashMap<ShardId, ShardMapping>,
        op: BatchMutate,
    ) -> Vec<MutateResponse> {
        let mut tasks = JoinSet::new();
        for (shard, mapping) in mappings {
            let manager = Arc::clone(&self.manager);
            let protocol = self.protocol;
            tasks.spawn(
                async move { mutate_multi_shard(manager, protocol, shard, mapping, op).await },
            );
        }
        self.gather_mutates(tasks).await
    }

    async fn gather_mutates(&self, mut tasks: JoinSet<Vec<MutateResponse>>) -> Vec<MutateResponse> {
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(responses) => results.extend(responses),
                Err(err) => error!(error = %err, "mutation shard task failed"),
            }
        }
        results
    }

    // -- Fleet-wide operations ------------------------------------------------

    /// Invalidate every entry on every shard. Reports the first failure
    /// encountered; all shards are attempted regardless.
    pub async fn flush(&self, expiration: u32) -> GenericResponse {
        let mut first_err = None;
        for (shard, addr, conn) in self.manager.get_all_shards().await {
            let resp = match conn {
                None => GenericResponse::from_error(connection_error(&addr, None)),
                Some(PoolConn { addr, channel }) => {
                    let mut client = RawClient::new(self.protocol, shard, channel);
                    let resp = client.flush(expiration).await;
                    dispose(&self.manager, addr, client).await;
                    resp
                }
            };
            if first_err.is_none() {
                first_err = resp.error();
            }
        }
        match first_err {
            Some(err) => GenericResponse::from_error(err),
            None => GenericResponse::new(ResponseStatus::NoError),
        }
    }

    /// Set logging verbosity on every shard; first failure reported.
    pub async fn verbosity(&self, verbosity: u32) -> GenericResponse {
        let mut first_err = None;
        for (shard, addr, conn) in self.manager.get_all_shards().await {
            let resp = match conn {
                None => GenericResponse::from_error(connection_error(&addr, None)),
                Some(PoolConn { addr, channel }) => {
                    let mut client = RawClient::new(self.protocol, shard, channel);
                    let resp = client.verbosity(verbosity).await;
                    dispose(&self.manager, addr, client).await;
                    resp
                }
            };
            if first_err.is_none() {
                first_err = resp.error();
            }
        }
        match first_err {
            Some(err) => GenericResponse::from_error(err),
            None => GenericResponse::new(ResponseStatus::NoError),
        }
    }

    /// Fetch statistics from every shard, merged by shard id. Entries from
    /// shards that answered are kept even when another shard failed.
    pub async fn stat(&self, stats_key: &str) -> StatResponse {
        let mut entries = HashMap::new();
        let mut first_err = None;

        for (shard, addr, conn) in self.manager.get_all_shards().await {
            let resp = match conn {
                None => StatResponse::from_error(connection_error(&addr, None), HashMap::new()),
                Some(PoolConn { addr, channel }) => {
                    let mut client = RawClient::new(self.protocol, shard, channel);
                    let resp = client.stat(stats_key).await;
                    dispose(&self.manager, addr, client).await;
                    resp
                }
            };
            if first_err.is_none() {
                first_err = resp.error();
            }
            for (shard_id, shard_entries) in resp.entries() {
                entries.insert(*shard_id, shard_entries.clone());
            }
        }

        match first_err {
            Some(err) => StatResponse::from_error(err, entries),
            None => StatResponse::new(ResponseStatus::NoError, entries),
        }
    }

    /// Fetch every shard's version string, merged by shard id.
    pub async fn version(&self) -> VersionResponse {
        let mut versions = HashMap::new();
        let mut first_err = None;

        for (shard, addr, conn) in self.manager.get_all_shards().await {
            let resp = match conn {
                None => VersionResponse::from_error(connection_error(&addr, None), HashMap::new()),
                Some(PoolConn { addr, channel }) => {
                    let mut client = RawClient::new(self.protocol, shard, channel);
                    let resp = client.version().await;
                    dispose(&self.manager, addr, client).await;
                    resp
                }
            };
            if first_err.is_none() {
                first_err = resp.error();
            }
            for (shard_id, version) in resp.versions() {
                versions.insert(*shard_id, version.clone());
            }
        }

        match first_err {
            Some(err) => VersionResponse::from_error(err, versions),
            None => VersionResponse::new(ResponseStatus::NoError, versions),
        }
    }
}

/// Hand a finished client's channel back to the pool; the typed
/// disposition decides between release and discard.
async fn dispose(manager: &ShardManager, addr: String, client: RawClient<Box<dyn Channel>>) {
    match client.finish() {
        Disposition::Reuse(channel) => {
            manager.pool().release(PoolConn { addr, channel }).await;
        }
        Disposition::Discard(channel) => {
            debug!(shard = %addr, "discarding desynced connection");
            manager.pool().discard(PoolConn { addr, channel }).await;
        }
    }
}

fn connection_error(shard: &str, cause: Option<Error>) -> Error {
    Error::ConnectionUnavailable {
        shard: shard.to_owned(),
        cause: cause.map(Box::new),
    }
}

/// Per-shard worker for [`ShardedClient::get_multi`].
async fn get_multi_shard(
    manager: Arc<ShardManager>,
    protocol: Protocol,
    shard: ShardId,
    mapping: ShardMapping,
) -> HashMap<String, GetResponse> {
    let ShardMapping {
        address,
        connection,
        conn_err,
        keys,
        ..
    } = mapping;

    if shard == UNMAPPED_SHARD {
        return keys
            .into_iter()
            .map(|key| {
                let resp = GetResponse::from_error(&key, Error::NoShard(key.clone()));
                (key, resp)
            })
            .collect();
    }

    let shard_addr = address.unwrap_or_default();
    if let Some(err) = conn_err {
        return keys
            .into_iter()
            .map(|key| {
                let resp = GetResponse::from_error(
                    &key,
                    connection_error(&shard_addr, Some(err.clone())),
                );
                (key, resp)
            })
            .collect();
    }

    let Some(PoolConn { addr, channel }) = connection else {
        return keys
            .into_iter()
            .map(|key| {
                let resp = GetResponse::miss(&key);
                (key, resp)
            })
            .collect();
    };

    let mut client = RawClient::new(protocol, shard, channel);
    let results = client.get_multi(&keys).await;
    dispose(&manager, addr, client).await;
    results
}

/// Per-shard worker for the batched mutations.
async fn mutate_multi_shard(
    manager: Arc<ShardManager>,
    protocol: Protocol,
    shard: ShardId,
    mapping: ShardMapping,
    op: BatchMutate,
) -> Vec<MutateResponse> {
    let warming_up = mapping.warming_up && op == BatchMutate::Sentinel;
    let ShardMapping {
        address,
        connection,
        conn_err,
        items,
        ..
    } = mapping;

    let responses = if shard == UNMAPPED_SHARD {
        items
            .iter()
            .map(|item| MutateResponse::from_error(&item.key, Error::NoShard(item.key.clone())))
            .collect()
    } else if let Some(err) = conn_err {
        let shard_addr = address.unwrap_or_default();
        items
            .iter()
            .map(|item| {
                MutateResponse::from_error(
                    &item.key,
                    connection_error(&shard_addr, Some(err.clone())),
                )
            })
            .collect()
    } else if let Some(PoolConn { addr, channel }) = connection {
        let mut client = RawClient::new(protocol, shard, channel);
        let responses = match op {
            BatchMutate::Set => client.set_multi(&items).await,
            BatchMutate::Sentinel => client.set_sentinels(&items).await,
            BatchMutate::Add => client.add_multi(&items).await,
        };
        dispose(&manager, addr, client).await;
        responses
    } else {
        // No routable shard: report success with the zero version id.
        items
            .iter()
            .map(|item| MutateResponse::new(&item.key, ResponseStatus::NoError, 0))
            .collect()
    };

    if warming_up {
        mask_warming_failures(responses)
    } else {
        responses
    }
}

/// Per-shard worker for [`ShardedClient::delete_multi`].
async fn delete_multi_shard(
    manager: Arc<ShardManager>,
    protocol: Protocol,
    shard: ShardId,
    mapping: ShardMapping,
) -> Vec<MutateResponse> {
    let ShardMapping {
        address,
        connection,
        conn_err,
        keys,
        ..
    } = mapping;

    if shard == UNMAPPED_SHARD {
        return keys
            .iter()
            .map(|key| MutateResponse::from_error(key, Error::NoShard(key.clone())))
            .collect();
    }

    if let Some(err) = conn_err {
        let shard_addr = address.unwrap_or_default();
        return keys
            .iter()
            .map(|key| {
                MutateResponse::from_error(key, connection_error(&shard_addr, Some(err.clone())))
            })
            .collect();
    }

    let Some(PoolConn { addr, channel }) = connection else {
        return keys
            .iter()
            .map(|key| MutateResponse::new(key, ResponseStatus::NoError, 0))
            .collect();
    };

    let mut client = RawClient::new(protocol, shard, channel);
    let responses = client.delete_multi(&keys).await;
    dispose(&manager, addr, client).await;
    responses
}

/// A shard in warm-up absorbs sentinel writes best-effort: whatever went
/// wrong, the caller sees a success with the zero version id.
fn mask_warming_failures(responses: Vec<MutateResponse>) -> Vec<MutateResponse> {
    responses
        .into_iter()
        .map(|resp| {
            if resp.error().is_some() {
                MutateResponse::new(resp.key(), ResponseStatus::NoError, 0)
            } else {
                resp
            }
        })
        .collect()
}
