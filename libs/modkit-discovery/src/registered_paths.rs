//! Every path this process created, for bulk cleanup on shutdown.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::coordinator::{CoordinationError, Coordinator};
use crate::error::RegistryError;

/// Concurrent set of created node paths, shared by all registrations of one
/// registry across repeated re-registration cycles.
///
/// Insertion order is kept so cleanup deletes in creation order.
#[derive(Debug, Default)]
pub struct RegisteredPathSet {
    paths: DashMap<String, u64>,
    next_seq: AtomicU64,
}

impl RegisteredPathSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.paths.entry(path.into()).or_insert(seq);
    }

    /// Stop tracking `path`. Returns `false` if it was not tracked.
    #[must_use]
    pub fn remove(&self, path: &str) -> bool {
        self.paths.remove(path).is_some()
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Tracked paths in creation order.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut entries: Vec<(u64, String)> = self
            .paths
            .iter()
            .map(|entry| (*entry.value(), entry.key().clone()))
            .collect();
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, path)| path).collect()
    }

    /// Delete every tracked path from the coordination service.
    ///
    /// Stops at the first failing delete and leaves that path and every later
    /// one tracked and in place. A path that is already gone counts as deleted.
    ///
    /// # Errors
    /// Returns [`RegistryError::PartialCleanup`] for the first failing delete.
    pub async fn clear(&self, coordinator: &dyn Coordinator) -> Result<(), RegistryError> {
        let paths = self.paths();
        let total = paths.len();
        for (idx, path) in paths.into_iter().enumerate() {
            match coordinator.delete(&path, None).await {
                Ok(()) | Err(CoordinationError::NoNode) => {
                    self.paths.remove(&path);
                    tracing::debug!(path = %path, "registered path deleted");
                }
                Err(source) => {
                    tracing::warn!(path = %path, error = %source, "failed to delete registered path");
                    return Err(RegistryError::PartialCleanup {
                        path,
                        remaining: total - idx,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}
