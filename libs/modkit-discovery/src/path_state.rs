//! Current assigned path of one registration.

use parking_lot::RwLock;

/// Holder of the ephemeral path currently assigned to a registration.
///
/// Read by the watch loop and the watchdog on every iteration, written only
/// when a node is created or found missing.
#[derive(Debug, Default)]
pub struct PathState {
    path: RwLock<Option<String>>,
}

impl PathState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently assigned path, `None` while unregistered.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.path.read().clone()
    }

    pub fn set(&self, path: impl Into<String>) {
        *self.path.write() = Some(path.into());
    }

    pub fn clear(&self) {
        *self.path.write() = None;
    }

    /// Clear only if the stored path is still `expected`.
    ///
    /// Returns `false` when another loop already replaced or cleared it.
    #[must_use]
    pub fn clear_if(&self, expected: &str) -> bool {
        let mut guard = self.path.write();
        if guard.as_deref() == Some(expected) {
            *guard = None;
            true
        } else {
            false
        }
    }
}
