use std::sync::Arc;

use crate::axes::{AxisName, AxisSet};
use crate::replication::RuleRegistry;

/// Options for a sharded region.
///
/// The defaults check replication, rewrite the body so that every value carries a precise replication type, treat
/// every mesh axis as manual, and skip numeric fault detection.
#[derive(Clone, Debug)]
pub struct ShardMapConfig {
    /// Whether to statically check that every output is replicated over the mesh axes its out spec does not mention.
    pub check_replication: bool,

    /// Whether to rewrite the region body by inserting `pvary` where values of different replication meet. Only
    /// meaningful when `check_replication` is also set.
    pub rewrite: bool,

    /// Mesh axes that stay under automatic partitioning inside the region.
    pub auto_axes: AxisSet,

    /// Whether eager evaluation fails on `nan` results.
    pub debug_nans: bool,

    /// Whether eager evaluation fails on infinite results.
    pub debug_infs: bool,

    /// Rule registry used for checking and rewriting. [`RuleRegistry::global`] is used when unset.
    pub registry: Option<Arc<RuleRegistry>>,
}

impl ShardMapConfig {
    /// Enables or disables replication checking. Rewriting follows the same setting.
    pub fn with_check_replication(mut self, check_replication: bool) -> Self {
        self.check_replication = check_replication;
        self.rewrite = check_replication;
        self
    }

    pub fn with_rewrite(mut self, rewrite: bool) -> Self {
        self.rewrite = rewrite;
        self
    }

    pub fn with_auto_axes<I, S>(mut self, axes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AxisName>,
    {
        self.auto_axes = axes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_debug_nans(mut self, debug_nans: bool) -> Self {
        self.debug_nans = debug_nans;
        self
    }

    pub fn with_debug_infs(mut self, debug_infs: bool) -> Self {
        self.debug_infs = debug_infs;
        self
    }

    pub fn with_registry(mut self, registry: Arc<RuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Returns `true` if the body is rewritten, which requires replication checking.
    pub fn rewrites(&self) -> bool {
        self.check_replication && self.rewrite
    }

    /// Returns the rule registry used for this region.
    pub fn registry(&self) -> &RuleRegistry {
        match &self.registry {
            Some(registry) => registry.as_ref(),
            None => RuleRegistry::global(),
        }
    }
}

impl Default for ShardMapConfig {
    fn default() -> Self {
        Self {
            check_replication: true,
            rewrite: true,
            auto_axes: AxisSet::new(),
            debug_nans: false,
            debug_infs: false,
            registry: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::axes::axis_set;

    #[test]
    fn test_shard_map_config() {
        let config = ShardMapConfig::default();
        assert!(config.check_replication);
        assert!(config.rewrites());
        assert!(config.auto_axes.is_empty());
        assert!(std::ptr::eq(config.registry(), RuleRegistry::global()));

        let config = ShardMapConfig::default().with_check_replication(false);
        assert!(!config.rewrite);
        assert!(!config.rewrites());

        let config = ShardMapConfig::default().with_rewrite(false).with_auto_axes(["y"]).with_debug_nans(true);
        assert!(config.check_replication);
        assert!(!config.rewrites());
        assert_eq!(config.auto_axes, axis_set(["y"]));
        assert!(config.debug_nans);
        assert!(!config.debug_infs);

        let registry = Arc::new(RuleRegistry::new());
        let config = ShardMapConfig::default().with_registry(registry.clone());
        assert!(std::ptr::eq(config.registry(), registry.as_ref()));
    }
}
