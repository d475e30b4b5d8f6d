//! Indexer configuration

use crate::error::{IndexerError, Result};

/// Default number of superseded index roots kept before garbage
/// collection may delete them.
pub const DEFAULT_GC_KEEP_ROOTS: u32 = 3;

/// Configuration for index building
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Target estimated bytes per leaf node
    ///
    /// The rebalancer closes a leaf when adding the next flake would
    /// push it past this. Default: 187,500
    pub leaf_target_bytes: u64,

    /// Maximum estimated bytes per leaf node
    ///
    /// Hard ceiling; must be at least `leaf_target_bytes`.
    /// Default: 375,000
    pub leaf_max_bytes: u64,

    /// Target number of children per branch node
    ///
    /// Branch folding groups children into branches of at most this
    /// many. Default: 100
    pub branch_target_children: usize,

    /// Maximum number of children per branch node
    ///
    /// Hard limit to prevent oversized branches.
    /// Default: 200
    pub branch_max_children: usize,

    /// Novelty size (bytes) at which a reindex becomes worthwhile.
    /// Default: 100,000
    pub reindex_min_bytes: usize,

    /// Novelty size (bytes) at which a reindex is mandatory before
    /// further commits. Default: 1,000,000
    pub reindex_max_bytes: usize,

    /// Number of superseded root generations retained before garbage
    /// collection deletes them and their trees. Default: 3
    pub gc_keep_roots: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            leaf_target_bytes: 187_500,
            leaf_max_bytes: 375_000,
            branch_target_children: 100,
            branch_max_children: 200,
            reindex_min_bytes: 100_000,
            reindex_max_bytes: 1_000_000,
            gc_keep_roots: DEFAULT_GC_KEEP_ROOTS,
        }
    }
}

impl IndexerConfig {
    /// Create a new configuration with custom tree-shape values
    pub fn new(
        leaf_target_bytes: u64,
        leaf_max_bytes: u64,
        branch_target_children: usize,
        branch_max_children: usize,
    ) -> Self {
        Self {
            leaf_target_bytes,
            leaf_max_bytes,
            branch_target_children,
            branch_max_children,
            ..Self::default()
        }
    }

    /// Create a configuration optimized for small datasets
    pub fn small() -> Self {
        Self {
            leaf_target_bytes: 50_000,
            leaf_max_bytes: 100_000,
            branch_target_children: 20,
            branch_max_children: 40,
            ..Self::default()
        }
    }

    /// Check thresholds for zero or inverted values.
    pub fn validate(&self) -> Result<()> {
        if self.leaf_target_bytes == 0 {
            return Err(IndexerError::InvalidConfig(
                "leaf_target_bytes must be positive".to_string(),
            ));
        }
        if self.leaf_max_bytes < self.leaf_target_bytes {
            return Err(IndexerError::InvalidConfig(format!(
                "leaf_max_bytes ({}) below leaf_target_bytes ({})",
                self.leaf_max_bytes, self.leaf_target_bytes
            )));
        }
        if self.branch_target_children < 2 {
            return Err(IndexerError::InvalidConfig(
                "branch_target_children must be at least 2".to_string(),
            ));
        }
        if self.branch_max_children < self.branch_target_children {
            return Err(IndexerError::InvalidConfig(format!(
                "branch_max_children ({}) below branch_target_children ({})",
                self.branch_max_children, self.branch_target_children
            )));
        }
        if self.reindex_max_bytes < self.reindex_min_bytes {
            return Err(IndexerError::InvalidConfig(format!(
                "reindex_max_bytes ({}) below reindex_min_bytes ({})",
                self.reindex_max_bytes, self.reindex_min_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(IndexerConfig::default().validate().is_ok());
        assert!(IndexerConfig::small().validate().is_ok());
    }

    #[test]
    fn test_zero_leaf_target_rejected() {
        let mut config = IndexerConfig::default();
        config.leaf_target_bytes = 0;
        assert!(matches!(
            config.validate(),
            Err(IndexerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_inverted_leaf_thresholds_rejected() {
        let mut config = IndexerConfig::default();
        config.leaf_max_bytes = config.leaf_target_bytes - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_branch_thresholds_rejected() {
        let mut config = IndexerConfig::default();
        config.branch_max_children = 10;
        config.branch_target_children = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_reindex_thresholds_rejected() {
        let mut config = IndexerConfig::default();
        config.reindex_min_bytes = 2_000_000;
        assert!(config.validate().is_err());
    }
}
