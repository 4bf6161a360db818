//! Service registry facade: register, discover and clean up through one
//! coordination client.

use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RegistryConfig;
use crate::coordinator::Coordinator;
use crate::discovery::{DiscoveryEngine, DiscoveryEvents};
use crate::error::RegistryError;
use crate::reconnect::ReconnectSupervisor;
use crate::registered_paths::RegisteredPathSet;
use crate::registration::{Advertisement, RegistrationEngine, RegistrationHandle};

/// Registers this process under service paths and discovers other members.
///
/// All registrations and discoveries share one reconnect supervisor, one set
/// of created paths and one cancellation token. Runtime faults are retried
/// internally; only validation, direct queries and cleanup return errors.
pub struct ServiceRegistry {
    coordinator: Arc<dyn Coordinator>,
    supervisor: Arc<ReconnectSupervisor>,
    registered: Arc<RegisteredPathSet>,
    config: RegistryConfig,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .field("registered_paths", &self.registered.len())
            .field("tasks", &self.tasks.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Create a registry with its own cancellation token.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        Self::with_cancellation(coordinator, config, &CancellationToken::new())
    }

    /// Create a registry stopped by `parent` (or by [`cancel`](Self::cancel)).
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidConfig`] if `config` fails validation.
    pub fn with_cancellation(
        coordinator: Arc<dyn Coordinator>,
        config: RegistryConfig,
        parent: &CancellationToken,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        let supervisor = Arc::new(ReconnectSupervisor::new(Arc::clone(&coordinator), &config));
        Ok(Self {
            coordinator,
            supervisor,
            registered: Arc::new(RegisteredPathSet::new()),
            config,
            cancel: parent.child_token(),
            tasks: TaskTracker::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ReconnectSupervisor> {
        &self.supervisor
    }

    /// Advertise `payload` under an ephemeral sequential node at `path_prefix`
    /// and keep it alive until cancelled.
    ///
    /// Returns once the loops are started; the node itself is created in the
    /// background. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidPath`] for a malformed prefix and
    /// [`RegistryError::Cancelled`] after cancellation.
    pub fn register(
        &self,
        path_prefix: &str,
        payload: impl Into<Bytes>,
    ) -> Result<RegistrationHandle, RegistryError> {
        validate_path(path_prefix, false)?;
        self.ensure_running()?;

        let advert = Advertisement::new(path_prefix, payload);
        tracing::info!(
            prefix = %advert.path_prefix,
            payload_len = advert.payload.len(),
            "registering service node and watching it"
        );
        let engine = RegistrationEngine::new(
            advert,
            Arc::clone(&self.coordinator),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.registered),
            &self.config,
            self.cancel.child_token(),
        );
        Ok(engine.start(&self.tasks))
    }

    /// Watch the members registered under `path`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidPath`] for a malformed path and
    /// [`RegistryError::Cancelled`] after cancellation.
    pub fn discover(&self, path: &str) -> Result<DiscoveryEvents, RegistryError> {
        validate_path(path, true)?;
        self.ensure_running()?;

        let engine = DiscoveryEngine::new(
            path,
            Arc::clone(&self.coordinator),
            Arc::clone(&self.supervisor),
            &self.config,
            self.cancel.child_token(),
        );
        Ok(engine.start(&self.tasks))
    }

    /// Raw child names of `path`, unordered and unfiltered.
    ///
    /// # Errors
    /// Returns the coordination error of the listing.
    pub async fn list_nodes(&self, path: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self.coordinator.children(path).await?)
    }

    /// # Errors
    /// Returns the coordination error if the session does not answer.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        Ok(self.coordinator.ping().await?)
    }

    /// Paths created by this registry that have not been cleaned up.
    #[must_use]
    pub fn registered_paths(&self) -> Vec<String> {
        self.registered.paths()
    }

    /// Delete every node this registry created.
    ///
    /// Stops at the first failing delete, leaving that path and all later
    /// ones in place.
    ///
    /// # Errors
    /// Returns [`RegistryError::PartialCleanup`] for the first failing delete.
    pub async fn clear_registered_paths(&self) -> Result<(), RegistryError> {
        self.registered.clear(self.coordinator.as_ref()).await
    }

    /// Stop every registration and discovery at its next wait. Idempotent.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("stopping service registration and discovery");
        }
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for every spawned loop to exit.
    pub async fn shutdown(&self) {
        self.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.cancel.is_cancelled() {
            Err(RegistryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn validate_path(path: &str, allow_root: bool) -> Result<(), RegistryError> {
    let reason = if path.is_empty() {
        Some("path is empty")
    } else if !path.starts_with('/') {
        Some("path must be absolute")
    } else if path == "/" {
        (!allow_root).then_some("root cannot be used as a node prefix")
    } else if path.ends_with('/') {
        Some("path must not end with '/'")
    } else if path.contains("//") {
        Some("path contains an empty segment")
    } else {
        None
    };
    reason.map_or(Ok(()), |reason| {
        Err(RegistryError::InvalidPath {
            path: path.to_owned(),
            reason,
        })
    })
}
