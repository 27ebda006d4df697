//! The shared tree-comparison cache.
//!
//! Maps `(old tree, new tree)` to the list of changed paths. Lookups go
//! through `moka`'s `try_get_with`, which deduplicates concurrent loads
//! per key, so two threads asking for the same comparison compute it
//! once. The cache is optional and can be shared across repositories.

use std::sync::Arc;

use moka::sync::Cache;

use crate::error::{Error, Result};
use crate::storage::{TreeDelta, TreeId};

#[derive(Clone)]
pub struct DiffCache {
    inner: Cache<(TreeId, TreeId), Arc<Vec<TreeDelta>>>,
}

impl DiffCache {
    /// A cache holding up to `capacity` tree comparisons.
    pub fn new(capacity: u64) -> Self {
        Self { inner: Cache::builder().max_capacity(capacity).build() }
    }

    /// Return the cached comparison for `(old, new)`, computing it with
    /// `load` on a miss. Concurrent misses for the same key share one
    /// computation.
    pub(crate) fn get_with<F>(&self, old: TreeId, new: TreeId, load: F) -> Result<Arc<Vec<TreeDelta>>>
    where
        F: FnOnce() -> Result<Vec<TreeDelta>>,
    {
        let key = (old, new);
        let hit = self.inner.contains_key(&key);
        let result = self
            .inner
            .try_get_with(key, || load().map(Arc::new))
            .map_err(|e: Arc<Error>| match Arc::try_unwrap(e) {
                Ok(error) => error,
                Err(shared) => Error::storage(shared.to_string()),
            });
        if !hit {
            tracing::debug!(
                old = %old.short_hex(),
                new = %new.short_hex(),
                "tree comparison cache miss"
            );
        }
        result
    }
}

impl Default for DiffCache {
    fn default() -> Self {
        Self::new(1024)
    }
}
