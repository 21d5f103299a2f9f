//! Fixed-depth prefix tree over a cluster arena.
//!
//! ```text
//! bucket (token count) ──► prefix token ──► ... ──► leaf: [ClusterId; ≤ C]
//!                                                           │
//!                                 clusters: BTreeMap<ClusterId, Cluster>
//! ```
//!
//! Nodes only hold cluster handles; the clusters themselves live in one arena
//! so that eviction and serialization never chase references. Both maps are
//! ordered, which keeps the serialized form stable across save/load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::cluster::{Cluster, ClusterId, WILDCARD};
use super::sequence::TokenSequence;
use super::DrainConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Node {
    children: BTreeMap<String, Node>,
    clusters: Vec<ClusterId>,
}

impl Node {
    /// Child key a token is stored under when inserting.
    ///
    /// Tokens containing digits go to the wildcard child. Otherwise the token
    /// gets its own child while the node has room, leaving one slot for the
    /// wildcard child that absorbs everything past `max_children`.
    fn route_key(&self, token: &str, max_children: usize) -> String {
        if self.children.contains_key(token) {
            return token.to_string();
        }
        if has_digit(token) {
            return WILDCARD.to_string();
        }

        let children = self.children.len();
        let has_wildcard = self.children.contains_key(WILDCARD);
        let room = if has_wildcard {
            children < max_children
        } else {
            children + 1 < max_children
        };

        if room {
            token.to_string()
        } else {
            WILDCARD.to_string()
        }
    }

    fn depth(&self) -> usize {
        self.children
            .values()
            .map(|child| 1 + child.depth())
            .max()
            .unwrap_or(0)
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a [ClusterId]>) {
        if !self.clusters.is_empty() {
            out.push(&self.clusters);
        }
        for child in self.children.values() {
            child.collect_leaves(out);
        }
    }
}

#[inline]
fn has_digit(token: &str) -> bool {
    token.bytes().any(|b| b.is_ascii_digit())
}

/// Number of prefix-token levels a sequence of `len` tokens descends.
///
/// The root, the bucket level and the leaf level take three of the
/// configured depth; the last token of a line is never used as a key.
#[inline]
fn prefix_len(config: &DrainConfig, len: usize) -> usize {
    config.prefix_depth().min(len.saturating_sub(1))
}

/// The clustering state of the miner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTree {
    buckets: BTreeMap<usize, Node>,
    clusters: BTreeMap<ClusterId, Cluster>,
    /// Last allocated cluster id.
    last_id: ClusterId,
    /// Logical clock, bumped on every create or match.
    clock: u64,
}

impl ClusterTree {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================================================
    // ACCESSORS
    // ============================================================================================

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    /// All live clusters, ordered by id.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// Token counts that have a bucket.
    pub fn bucket_keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.buckets.keys().copied()
    }

    /// Deepest chain of prefix-token levels under any bucket.
    pub fn prefix_depth(&self) -> usize {
        self.buckets.values().map(Node::depth).max().unwrap_or(0)
    }

    /// Cluster lists of every non-empty leaf.
    pub fn leaves(&self) -> Vec<&[ClusterId]> {
        let mut out = Vec::new();
        for bucket in self.buckets.values() {
            bucket.collect_leaves(&mut out);
        }
        out
    }

    // ============================================================================================
    // LOOKUP
    // ============================================================================================

    /// Candidate clusters for `seq`: the leaf its prefix leads to.
    ///
    /// Each level follows the literal child first and falls back to the
    /// wildcard child. Returns `None` when the path does not exist.
    pub fn candidates(&self, seq: &TokenSequence, config: &DrainConfig) -> Option<&[ClusterId]> {
        let mut node = self.buckets.get(&seq.len())?;

        for token in seq.tokens().iter().take(prefix_len(config, seq.len())) {
            let current = node;
            node = current
                .children
                .get(token.as_str())
                .or_else(|| current.children.get(WILDCARD))?;
        }

        Some(&node.clusters)
    }

    // ============================================================================================
    // MUTATION
    // ============================================================================================

    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn cluster_mut(&mut self, id: ClusterId) -> Option<&mut Cluster> {
        self.clusters.get_mut(&id)
    }

    /// Create a singleton cluster for `seq` and index it.
    ///
    /// When the target leaf is already at capacity, the cluster with the
    /// lowest match count (oldest first on ties) is removed before the new one
    /// goes in. Returns the new id and the evicted cluster, if any.
    pub(crate) fn create(
        &mut self,
        seq: &TokenSequence,
        config: &DrainConfig,
    ) -> (ClusterId, Option<Cluster>) {
        self.last_id += 1;
        let id = self.last_id;
        let clock = self.tick();

        let capacity = config.max_clusters_per_leaf.max(1);
        let max_children = config.max_children;
        let depth = prefix_len(config, seq.len());

        let mut node = self.buckets.entry(seq.len()).or_default();
        for token in seq.tokens().iter().take(depth) {
            let key = node.route_key(token, max_children);
            node = node.children.entry(key).or_default();
        }

        let mut evicted_id = None;
        if node.clusters.len() >= capacity {
            let clusters = &self.clusters;
            let victim = node
                .clusters
                .iter()
                .enumerate()
                .min_by_key(|(_, cid)| {
                    clusters
                        .get(cid)
                        .map(|c| (c.size(), c.created_seq()))
                        .unwrap_or((0, 0))
                })
                .map(|(pos, _)| pos);
            if let Some(pos) = victim {
                evicted_id = Some(node.clusters.remove(pos));
            }
        }
        node.clusters.push(id);

        let evicted = evicted_id.and_then(|cid| self.clusters.remove(&cid));
        self.clusters.insert(id, Cluster::new(id, seq, clock));

        (id, evicted)
    }
}
