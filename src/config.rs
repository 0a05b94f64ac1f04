//! Recovery configuration.
//!
//! Persisted as pretty JSON:
//!
//! ```text
//! {
//!   "strategy": "requested",
//!   "parent_cache_capacity": 1024,
//!   "prefetch": false
//! }
//! ```
//!
//! Missing fields take their defaults, so an empty object is a valid file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::strategy::Strategy;

/// Default number of recovery nodes remembered as parent candidates.
pub const DEFAULT_PARENT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Which shards a recovery session wants beyond the requested ones, and
    /// what the DAG session prefetches.
    pub strategy: Strategy,
    /// Upper bound on cached parents. The oldest entry is evicted first.
    pub parent_cache_capacity: usize,
    /// Prefetch a cached parent's shards in the background.
    pub prefetch: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Requested,
            parent_cache_capacity: DEFAULT_PARENT_CACHE_CAPACITY,
            prefetch: false,
        }
    }
}

impl RecoveryConfig {
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Read config from `path`. Returns None if the file doesn't exist.
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(Some(config))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
