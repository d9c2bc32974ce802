//! MD5-based consistent hash ring.
//!
//! Maps arbitrary string keys onto a set of named nodes. Each node is hashed
//! into 120 virtual points (40 MD5 digests, 3 four-byte windows each), so
//! adding or removing one node remaps only ~1/N of the key space instead of
//! reshuffling everything.
//!
//! The ring is immutable once built; a topology change builds a new ring.
//! Shard assignment computed elsewhere (e.g. by an out-of-process balancer)
//! agrees with this ring as long as both sides hash the same identity
//! strings, because every lookup reduces to the same MD5 digests.

use std::collections::HashSet;

/// Number of MD5 digests computed per node.
const DIGESTS_PER_NODE: usize = 40;

/// Number of four-byte windows taken from each digest.
const POINTS_PER_DIGEST: usize = 3;

/// Immutable consistent hash ring over a set of named nodes.
///
/// ```
/// use shoal_ring::HashRing;
///
/// let ring = HashRing::new(&["cache0:11211", "cache1:11211"]);
/// let node = ring.get_node("user:1234").unwrap();
/// assert!(node == "cache0:11211" || node == "cache1:11211");
/// ```
#[derive(Clone, Debug)]
pub struct HashRing {
    /// Sorted `(hash point, node index)` pairs.
    points: Box<[(u32, u32)]>,
    nodes: Vec<String>,
}

impl HashRing {
    /// Build a ring from node identity strings.
    ///
    /// An empty node list produces a well-formed empty ring on which
    /// [`get_node`](HashRing::get_node) returns `None`. Duplicate names are
    /// tolerated; they give the repeated name more ring points but never
    /// fail.
    pub fn new<S: AsRef<str>>(nodes: &[S]) -> Self {
        Self::from_nodes(nodes.iter().map(|n| n.as_ref().to_owned()).collect())
    }

    /// Build a ring taking ownership of the node names.
    pub fn from_nodes(nodes: Vec<String>) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * DIGESTS_PER_NODE * POINTS_PER_DIGEST);

        for (idx, node) in nodes.iter().enumerate() {
            for j in 0..DIGESTS_PER_NODE {
                let digest = md5::compute(format!("{node}-{j}"));
                for w in 0..POINTS_PER_DIGEST {
                    let off = w * 4;
                    let hash = u32::from_le_bytes([
                        digest[off],
                        digest[off + 1],
                        digest[off + 2],
                        digest[off + 3],
                    ]);
                    points.push((hash, idx as u32));
                }
            }
        }

        points.sort_unstable_by_key(|&(hash, _)| hash);

        HashRing {
            points: points.into_boxed_slice(),
            nodes,
        }
    }

    /// Map a key to its owning node, or `None` on an empty ring.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let pos = self.position(key);
        Some(self.nodes[self.points[pos].1 as usize].as_str())
    }

    /// All distinct nodes ordered by ring proximity to `key`.
    ///
    /// The first entry equals [`get_node`](HashRing::get_node); the rest form
    /// the failover preference order. Empty on an empty ring.
    pub fn get_nodes(&self, key: &str) -> Vec<&str> {
        if self.points.is_empty() {
            return Vec::new();
        }

        let pos = self.position(key);
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let mut result = Vec::with_capacity(self.nodes.len());

        for i in 0..self.points.len() {
            let (_, idx) = self.points[(pos + i) % self.points.len()];
            let node = self.nodes[idx as usize].as_str();
            if seen.insert(node) {
                result.push(node);
            }
            if result.len() == self.nodes.len() {
                break;
            }
        }

        result
    }

    /// Number of nodes the ring was built from (duplicates included).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of virtual points on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Index of the first ring point strictly greater than the key's hash,
    /// wrapping to the start of the ring. Requires a nonempty ring.
    fn position(&self, key: &str) -> usize {
        let hash = key_hash(key);
        let pos = self.points.partition_point(|&(point, _)| point <= hash);
        if pos == self.points.len() { 0 } else { pos }
    }
}

/// Hash a key to its ring position: first four MD5 bytes, little-endian.
fn key_hash(key: &str) -> u32 {
    let digest = md5::compute(key.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
