//! Online template mining with a fixed-depth Drain tree.
//!
//! Lines are bucketed by token count, routed through a short prefix of their
//! leading tokens, and compared against the handful of clusters in the leaf
//! they land on. A close enough cluster absorbs the line (differing positions
//! become wildcards); otherwise the line starts a new cluster.

pub mod cluster;
pub mod miner;
pub mod sequence;
pub mod tree;

pub use cluster::{Cluster, ClusterId, Token, WILDCARD};
pub use miner::{Classification, ClusterChange, TemplateMiner};
pub use sequence::TokenSequence;
pub use tree::ClusterTree;

/// Tuning knobs of the clustering tree.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainConfig {
    /// Minimum similarity (inclusive) for a line to join an existing cluster.
    pub sim_threshold: f64,
    /// Maximum tree depth, counting the root, the token-count level and the
    /// leaf level. Must be at least 3.
    pub max_depth: usize,
    /// Maximum children of an inner prefix node.
    pub max_children: usize,
    /// Maximum clusters held by one leaf.
    pub max_clusters_per_leaf: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            sim_threshold: 0.4,
            max_depth: 4,
            max_children: 100,
            max_clusters_per_leaf: 64,
        }
    }
}

impl DrainConfig {
    /// Number of leading tokens used as prefix-tree keys.
    pub fn prefix_depth(&self) -> usize {
        self.max_depth.saturating_sub(3)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.sim_threshold > 0.0 && self.sim_threshold <= 1.0) {
            return Err(format!(
                "similarity threshold must be in (0, 1], got {}",
                self.sim_threshold
            ));
        }
        if self.max_depth < 3 {
            return Err(format!("max depth must be at least 3, got {}", self.max_depth));
        }
        if self.max_children < 2 {
            return Err(format!(
                "max children must be at least 2, got {}",
                self.max_children
            ));
        }
        if self.max_clusters_per_leaf == 0 {
            return Err("max clusters per leaf must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DrainConfig::default().validate().is_ok());
        assert_eq!(DrainConfig::default().prefix_depth(), 1);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let bad_threshold = DrainConfig {
            sim_threshold: 0.0,
            ..DrainConfig::default()
        };
        assert!(bad_threshold.validate().is_err());

        let shallow = DrainConfig {
            max_depth: 2,
            ..DrainConfig::default()
        };
        assert!(shallow.validate().is_err());

        let no_leaf_room = DrainConfig {
            max_clusters_per_leaf: 0,
            ..DrainConfig::default()
        };
        assert!(no_leaf_room.validate().is_err());

        let full_match = DrainConfig {
            sim_threshold: 1.0,
            ..DrainConfig::default()
        };
        assert!(full_match.validate().is_ok());
    }
}
