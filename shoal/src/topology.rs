//! Shard topology: which servers exist, what state they are in, and which
//! shard owns a given key.
//!
//! Keys are routed with a consistent-hash ring keyed by `host:port`, so any
//! out-of-process system hashing the same identity strings agrees with this
//! client about shard assignment. Connections are resolved to `ip:port`
//! through the shard specs' address fields.
//!
//! The shard list and ring are swapped together under one write lock, so
//! readers never observe a list/ring pair from two different updates.
//! Readers hold the read lock across the per-call grouping, including
//! connection acquisition from the pool; pool implementations must not
//! block on this manager in return.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use shoal_ring::HashRing;

use crate::pool::{ConnectionPool, PoolConn};
use crate::{Error, Item, ShardId, UNMAPPED_SHARD};

/// Lifecycle state of one shard within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardLifecycle {
    /// Fully live: serves reads and writes.
    Active,
    /// Accepts sentinel writes but is not read from.
    WriteOnly,
    /// Registered but unusable.
    Down,
    /// Joining the fleet: absorbs sentinel writes, and failures while doing
    /// so are not surfaced to callers.
    WarmUp,
}

/// One shard endpoint: ring identity (`host:port`), connect address
/// (`ip:port`) and lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub host: String,
    pub ip: String,
    pub port: u16,
    pub state: ShardLifecycle,
}

impl ShardSpec {
    /// An active shard whose host name doubles as its connect address.
    pub fn active(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        ShardSpec {
            ip: host.clone(),
            host,
            port,
            state: ShardLifecycle::Active,
        }
    }

    /// The ring identity string. Must be stable across processes.
    pub fn ring_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The address connections are made to.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Shard resolution for a single key.
#[derive(Debug)]
pub struct ShardLookup {
    /// Owning shard id, or [`UNMAPPED_SHARD`] when the topology is empty.
    pub shard: ShardId,
    /// Connect address of the owning shard, if any.
    pub address: Option<String>,
    /// A connection to the shard; `None` when the shard is not in a
    /// routable state or the pool failed.
    pub connection: Option<PoolConn>,
    /// The pool failure, when there is one.
    pub conn_err: Option<Error>,
}

/// Per-shard grouping of a batched call's inputs.
#[derive(Debug, Default)]
pub struct ShardMapping {
    /// Connect address of the shard; `None` for the unmapped grouping.
    pub address: Option<String>,
    /// A connection to the shard, when one could be produced.
    pub connection: Option<PoolConn>,
    /// The pool failure, when there is one.
    pub conn_err: Option<Error>,
    /// Keys assigned to this shard (key-based calls).
    pub keys: Vec<String>,
    /// Items assigned to this shard (item-based calls).
    pub items: Vec<Item>,
    /// Set for WarmUp shards in sentinel groupings: failures against this
    /// shard must be reported as success.
    pub warming_up: bool,
}

/// The routable-state filter to apply when grouping.
#[derive(Clone, Copy, PartialEq)]
enum Routing {
    /// Plain operations only use Active shards.
    Plain,
    /// Sentinel writes also go to WriteOnly and WarmUp shards.
    Sentinel,
}

struct Topology {
    shards: Vec<ShardSpec>,
    ring: HashRing,
    index_by_ring_key: HashMap<String, usize>,
}

impl Topology {
    fn empty() -> Self {
        Topology {
            shards: Vec::new(),
            ring: HashRing::new::<&str>(&[]),
            index_by_ring_key: HashMap::new(),
        }
    }

    fn build(shards: Vec<ShardSpec>) -> Self {
        let ring_keys: Vec<String> = shards.iter().map(ShardSpec::ring_key).collect();
        let mut index_by_ring_key = HashMap::with_capacity(shards.len());
        for (idx, key) in ring_keys.iter().enumerate() {
            index_by_ring_key.entry(key.clone()).or_insert(idx);
        }
        Topology {
            ring: HashRing::from_nodes(ring_keys),
            shards,
            index_by_ring_key,
        }
    }

    fn shard_index(&self, key: &str) -> Option<usize> {
        let node = self.ring.get_node(key)?;
        self.index_by_ring_key.get(node).copied()
    }
}

/// Tracks the current shard fleet and produces per-call shard groupings.
///
/// Start empty and feed it topology versions through
/// [`update_shards`](ShardManager::update_shards), or build a fixed fleet
/// with [`new_static`](ShardManager::new_static).
pub struct ShardManager {
    pool: Arc<dyn ConnectionPool>,
    topology: RwLock<Topology>,
}

impl ShardManager {
    /// A manager with no shards; every key is unmapped until the first
    /// [`update_shards`](ShardManager::update_shards).
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        ShardManager {
            pool,
            topology: RwLock::new(Topology::empty()),
        }
    }

    /// A manager over a fixed shard list that will never be updated.
    pub async fn new_static(pool: Arc<dyn ConnectionPool>, shards: Vec<ShardSpec>) -> Self {
        let manager = Self::new(pool);
        manager.update_shards(shards).await;
        manager
    }

    pub(crate) fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Swap in a new topology version.
    ///
    /// Endpoints entering the fleet are registered with the pool and
    /// departing ones unregistered, then the shard list and a freshly built
    /// ring replace the old pair under one write lock.
    pub async fn update_shards(&self, shards: Vec<ShardSpec>) {
        let mut topo = self.topology.write().await;

        let old: HashSet<String> = topo.shards.iter().map(ShardSpec::endpoint).collect();
        let new: HashSet<String> = shards.iter().map(ShardSpec::endpoint).collect();

        for addr in new.difference(&old) {
            info!(shard = %addr, "registering shard endpoint");
            if let Err(err) = self.pool.register(addr).await {
                warn!(shard = %addr, error = %err, "shard endpoint registration failed");
            }
        }
        for addr in old.difference(&new) {
            info!(shard = %addr, "unregistering shard endpoint");
            if let Err(err) = self.pool.unregister(addr).await {
                warn!(shard = %addr, error = %err, "shard endpoint unregistration failed");
            }
        }

        *topo = Topology::build(shards);
    }

    /// Number of shards in the current topology.
    pub async fn shard_count(&self) -> usize {
        self.topology.read().await.shards.len()
    }

    /// Resolve the shard for one key and try to produce a connection to it.
    pub async fn get_shard(&self, key: &str) -> ShardLookup {
        let topo = self.topology.read().await;

        let Some(idx) = topo.shard_index(key) else {
            return ShardLookup {
                shard: UNMAPPED_SHARD,
                address: None,
                connection: None,
                conn_err: None,
            };
        };

        let spec = &topo.shards[idx];
        let mut lookup = ShardLookup {
            shard: idx as ShardId,
            address: Some(spec.endpoint()),
            connection: None,
            conn_err: None,
        };

        if spec.state != ShardLifecycle::Active {
            debug!(shard = idx, state = ?spec.state, "shard is not in active state");
            return lookup;
        }

        match self.pool.get(&spec.endpoint()).await {
            Ok(conn) => lookup.connection = Some(conn),
            Err(err) => {
                warn!(shard = %spec.endpoint(), error = %err, "connection acquisition failed");
                lookup.conn_err = Some(err);
            }
        }
        lookup
    }

    /// Group keys by owning shard. Keys with no shard end up in the
    /// [`UNMAPPED_SHARD`] grouping rather than failing the call.
    pub async fn get_shards_for_keys<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> HashMap<ShardId, ShardMapping> {
        let topo = self.topology.read().await;
        let mut results: HashMap<ShardId, ShardMapping> = HashMap::new();

        for key in keys {
            let key = key.as_ref();
            let shard = shard_of(&topo, key);
            if !results.contains_key(&shard) {
                let entry = self.new_mapping(&topo, shard, Routing::Plain).await;
                results.insert(shard, entry);
            }
            if let Some(entry) = results.get_mut(&shard) {
                entry.keys.push(key.to_owned());
            }
        }
        results
    }

    /// Group items by owning shard; see
    /// [`get_shards_for_keys`](ShardManager::get_shards_for_keys).
    pub async fn get_shards_for_items(&self, items: &[Item]) -> HashMap<ShardId, ShardMapping> {
        self.group_items(items, Routing::Plain).await
    }

    /// Group sentinel items by owning shard. Unlike plain grouping this
    /// also routes to WriteOnly and WarmUp shards, and marks WarmUp
    /// groupings so their failures can be masked.
    pub async fn get_shards_for_sentinels(
        &self,
        items: &[Item],
    ) -> HashMap<ShardId, ShardMapping> {
        self.group_items(items, Routing::Sentinel).await
    }

    async fn group_items(
        &self,
        items: &[Item],
        routing: Routing,
    ) -> HashMap<ShardId, ShardMapping> {
        let topo = self.topology.read().await;
        let mut results: HashMap<ShardId, ShardMapping> = HashMap::new();

        for item in items {
            let shard = shard_of(&topo, &item.key);
            if !results.contains_key(&shard) {
                let entry = self.new_mapping(&topo, shard, routing).await;
                results.insert(shard, entry);
            }
            if let Some(entry) = results.get_mut(&shard) {
                entry.items.push(item.clone());
            }
        }
        results
    }

    /// A connection per shard, for fleet-wide operations. Shards whose
    /// connection cannot be produced are listed with `None`.
    pub async fn get_all_shards(&self) -> Vec<(ShardId, String, Option<PoolConn>)> {
        let topo = self.topology.read().await;
        let mut results = Vec::with_capacity(topo.shards.len());

        for (idx, spec) in topo.shards.iter().enumerate() {
            let conn = match self.pool.get(&spec.endpoint()).await {
                Ok(conn) => Some(conn),
                Err(err) => {
                    warn!(shard = %spec.endpoint(), error = %err, "connection acquisition failed");
                    None
                }
            };
            results.push((idx as ShardId, spec.endpoint(), conn));
        }
        results
    }

    /// Build one grouping entry, acquiring a connection when the shard's
    /// state permits. Called once per distinct shard per batched call.
    async fn new_mapping(&self, topo: &Topology, shard: ShardId, routing: Routing) -> ShardMapping {
        let mut entry = ShardMapping::default();
        if shard == UNMAPPED_SHARD {
            return entry;
        }

        let spec = &topo.shards[shard as usize];
        entry.address = Some(spec.endpoint());

        let routable = match routing {
            Routing::Plain => spec.state == ShardLifecycle::Active,
            Routing::Sentinel => matches!(
                spec.state,
                ShardLifecycle::Active | ShardLifecycle::WriteOnly | ShardLifecycle::WarmUp
            ),
        };
        if !routable {
            debug!(shard, state = ?spec.state, "shard is not in a routable state");
            return entry;
        }
        if routing == Routing::Sentinel && spec.state == ShardLifecycle::WarmUp {
            entry.warming_up = true;
        }

        match self.pool.get(&spec.endpoint()).await {
            Ok(conn) => entry.connection = Some(conn),
            Err(err) => {
                warn!(shard = %spec.endpoint(), error = %err, "connection acquisition failed");
                entry.conn_err = Some(err);
            }
        }
        entry
    }
}

fn shard_of(topo: &Topology, key: &str) -> ShardId {
    topo.shard_index(key)
        .map(|idx| idx as ShardId)
        .unwrap_or(UNMAPPED_SHARD)
}
