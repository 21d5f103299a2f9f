//! Template miner - assigns each line to a cluster and evolves its template.

use log::debug;

use super::cluster::{Cluster, ClusterId};
use super::sequence::TokenSequence;
use super::tree::ClusterTree;
use super::DrainConfig;
use crate::error::InputError;

/// What classifying a line did to its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterChange {
    /// The line started a new cluster.
    Created,
    /// The line matched and widened the template.
    TemplateChanged,
    /// The line matched the template as it was.
    Unchanged,
}

/// Result of [`TemplateMiner::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub cluster_id: ClusterId,
    /// Template after the update, wildcards rendered as `<*>`.
    pub template: String,
    /// Cluster match count after the update.
    pub size: u64,
    pub change: ClusterChange,
    /// Cluster dropped from a full leaf to make room, if any.
    pub evicted: Option<ClusterId>,
}

impl Classification {
    pub fn is_new(&self) -> bool {
        self.change == ClusterChange::Created
    }
}

/// Owns a [`ClusterTree`] for the duration of a run.
#[derive(Debug, Clone)]
pub struct TemplateMiner {
    config: DrainConfig,
    tree: ClusterTree,
}

impl TemplateMiner {
    pub fn new(config: DrainConfig) -> Self {
        Self::with_tree(config, ClusterTree::new())
    }

    /// Resume mining on a tree restored from persisted state.
    pub fn with_tree(config: DrainConfig, tree: ClusterTree) -> Self {
        Self { config, tree }
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    pub fn tree(&self) -> &ClusterTree {
        &self.tree
    }

    pub fn into_tree(self) -> ClusterTree {
        self.tree
    }

    /// Tokenize `text` and classify it.
    pub fn add_line(&mut self, text: &str) -> Result<Classification, InputError> {
        let seq = TokenSequence::parse(text)?;
        Ok(self.classify(&seq))
    }

    /// Assign `seq` to a cluster, creating one when nothing is similar enough.
    ///
    /// The threshold comparison is inclusive. Among equally similar
    /// candidates the one with more wildcards wins, then the older one.
    pub fn classify(&mut self, seq: &TokenSequence) -> Classification {
        if let Some(id) = self.best_match(seq) {
            let clock = self.tree.tick();
            if let Some(cluster) = self.tree.cluster_mut(id) {
                let changed = cluster.absorb(seq, clock);
                let change = if changed {
                    ClusterChange::TemplateChanged
                } else {
                    ClusterChange::Unchanged
                };
                debug!(
                    "line matched cluster {} (size={}, {:?})",
                    id,
                    cluster.size(),
                    change
                );
                return Classification {
                    cluster_id: id,
                    template: cluster.template_string(),
                    size: cluster.size(),
                    change,
                    evicted: None,
                };
            }
        }

        let (id, evicted) = self.tree.create(seq, &self.config);
        if let Some(ref victim) = evicted {
            debug!(
                "leaf full, evicted cluster {} (size={}) for new cluster {}",
                victim.id(),
                victim.size(),
                id
            );
        }

        let template = self
            .tree
            .cluster(id)
            .map(Cluster::template_string)
            .unwrap_or_default();
        debug!("created cluster {}: {}", id, template);

        Classification {
            cluster_id: id,
            template,
            size: 1,
            change: ClusterChange::Created,
            evicted: evicted.map(|c| c.id()),
        }
    }

    /// Read-only lookup: the cluster `seq` would join, without touching it.
    pub fn match_line(&self, seq: &TokenSequence) -> Option<ClusterId> {
        self.best_match(seq)
    }

    /// Values at the wildcard positions of `cluster_id` for `seq`.
    pub fn extract_parameters(&self, cluster_id: ClusterId, seq: &TokenSequence) -> Vec<String> {
        self.tree
            .cluster(cluster_id)
            .map(|c| c.extract_parameters(seq))
            .unwrap_or_default()
    }

    fn best_match(&self, seq: &TokenSequence) -> Option<ClusterId> {
        let candidates = self.tree.candidates(seq, &self.config)?;

        let mut best: Option<(f64, usize, &Cluster)> = None;
        for cluster in candidates.iter().filter_map(|id| self.tree.cluster(*id)) {
            let score = cluster.similarity(seq);
            let wildcards = cluster.wildcard_count();
            let better = match best {
                None => true,
                Some((best_score, best_wildcards, best_cluster)) => {
                    score > best_score
                        || (score == best_score
                            && (wildcards > best_wildcards
                                || (wildcards == best_wildcards
                                    && cluster.created_seq() < best_cluster.created_seq())))
                }
            };
            if better {
                best = Some((score, wildcards, cluster));
            }
        }

        best.filter(|(score, _, _)| *score >= self.config.sim_threshold)
            .map(|(_, _, cluster)| cluster.id())
    }
}
