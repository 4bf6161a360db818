use thiserror::Error;

use crate::coordinator::CoordinationError;

/// Errors surfaced synchronously by [`ServiceRegistry`](crate::ServiceRegistry).
///
/// Steady-state faults are retried inside the engines and never reach the
/// caller; only validation, direct queries and cleanup return errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// Path or prefix rejected before anything was sent to the service.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Configuration values out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be extracted.
    #[error("failed to load configuration: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The registry was cancelled; no new registrations or discoveries start.
    #[error("service registry is cancelled")]
    Cancelled,

    /// Direct query (`ping`, `list_nodes`) failed.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Bulk cleanup stopped at the first failing delete.
    #[error("failed to delete registered path '{path}' ({remaining} path(s) left undeleted): {source}")]
    PartialCleanup {
        path: String,
        /// Tracked paths still present after the failure, including `path`.
        remaining: usize,
        #[source]
        source: CoordinationError,
    },
}

impl From<figment::Error> for RegistryError {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}
