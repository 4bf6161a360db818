//! Registration engine: keeps one ephemeral advertisement node alive.
//!
//! Two tasks share a [`PathState`]:
//! - the watch loop creates the node, installs an existence watch on it and
//!   re-registers when the node disappears;
//! - the watchdog re-checks the node every `watchdog_interval` and recreates
//!   it if a watch notification never arrived.
//!
//! Creation goes through a per-registration gate that re-checks the path
//! state after acquiring it, so a vacancy is filled by exactly one create no
//! matter which task noticed it first.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RegistryConfig;
use crate::coordinator::Coordinator;
use crate::path_state::PathState;
use crate::reconnect::{Recovery, ReconnectSupervisor};
use crate::registered_paths::RegisteredPathSet;
use crate::retry::{self, Backoff};

/// What a process advertises: a node prefix and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Prefix the service appends the sequence to, e.g. `/services/api/node-`.
    pub path_prefix: String,
    pub payload: Bytes,
}

impl Advertisement {
    #[must_use]
    pub fn new(path_prefix: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            payload: payload.into(),
        }
    }
}

/// Lifecycle of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No live node; one will be created.
    Unregistered,
    /// Node creation in progress.
    Registering,
    /// Node exists and its existence watch is armed.
    Watching,
    /// Cancelled; terminal.
    Cancelled,
}

struct Registration {
    advert: Advertisement,
    coordinator: Arc<dyn Coordinator>,
    supervisor: Arc<ReconnectSupervisor>,
    registered: Arc<RegisteredPathSet>,
    path: PathState,
    create_gate: Mutex<()>,
    vacated: Notify,
    state: watch::Sender<RegistrationState>,
    retry_delay: Duration,
    watchdog_interval: Duration,
    cancel: CancellationToken,
}

impl Registration {
    fn set_state(&self, next: RegistrationState) {
        self.state.send_if_modified(|current| {
            if *current == RegistrationState::Cancelled || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Forget `path` if it is still the current one. Returns `true` if it was.
    fn vacate(&self, path: &str) -> bool {
        let cleared = self.path.clear_if(path);
        if cleared {
            self.set_state(RegistrationState::Unregistered);
        }
        let tracked = self.registered.remove(path);
        tracing::debug!(path = %path, cleared, tracked, "registered node vacated");
        cleared
    }

    async fn reconnect(&self) -> bool {
        self.supervisor.reconnect(&self.cancel).await != Recovery::Cancelled
    }

    /// Create the node unless one is already assigned. Returns `None` only
    /// when cancelled.
    async fn register_node(&self, origin: &'static str) -> Option<String> {
        let _gate = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            guard = self.create_gate.lock() => guard,
        };
        if let Some(path) = self.path.get() {
            return Some(path);
        }

        self.set_state(RegistrationState::Registering);
        let coordinator = &self.coordinator;
        let prefix = self.advert.path_prefix.as_str();
        let payload = &self.advert.payload;
        let path = retry::retry_forever(
            "create_ephemeral_sequential",
            &self.cancel,
            &self.supervisor,
            Backoff::flat(self.retry_delay),
            move || coordinator.create_ephemeral_sequential(prefix, payload.clone()),
        )
        .await?;

        self.path.set(path.clone());
        self.registered.insert(path.clone());
        tracing::info!(path = %path, origin, "service node registered");
        Some(path)
    }

    async fn run_watch_loop(self: Arc<Self>) {
        let prefix = self.advert.path_prefix.as_str();
        tracing::debug!(prefix = %prefix, "registration watch loop started");

        while !self.cancel.is_cancelled() {
            let Some(path) = self.path.get() else {
                if self.register_node("watch").await.is_none() {
                    break;
                }
                continue;
            };

            match self.coordinator.exists_watch(&path).await {
                Ok((true, watch)) => {
                    self.set_state(RegistrationState::Watching);
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = self.vacated.notified() => {}
                        event = watch.fired() => {
                            tracing::debug!(path = %path, ?event, "registered node watch fired");
                            if event.is_disconnect() && !self.reconnect().await {
                                break;
                            }
                        }
                    }
                }
                Ok((false, _)) => {
                    tracing::warn!(path = %path, "registered node no longer exists, re-registering");
                    self.vacate(&path);
                }
                Err(err) if err.is_connection_error() => {
                    tracing::warn!(path = %path, error = %err, "lost connection while watching registered node");
                    if !self.reconnect().await {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "failed to watch registered node, replacing it");
                    if let Err(e) = self.coordinator.delete(&path, None).await {
                        tracing::debug!(path = %path, error = %e, "failed to delete unwatchable node");
                    }
                    self.vacate(&path);
                    if !retry::pause(&self.cancel, self.retry_delay).await {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(RegistrationState::Cancelled);
        tracing::info!(prefix = %prefix, "service registration stopped");
    }

    async fn run_watchdog(self: Arc<Self>) {
        loop {
            if !retry::pause(&self.cancel, self.watchdog_interval).await {
                break;
            }

            if let Some(path) = self.path.get() {
                match self.coordinator.exists(&path).await {
                    Ok(true) => continue,
                    Ok(false) => {
                        tracing::warn!(path = %path, "watchdog found registered node missing");
                        // the watch loop may be parked on a watch that will never fire
                        if self.vacate(&path) {
                            self.vacated.notify_one();
                        }
                    }
                    Err(err) if err.is_connection_error() => {
                        tracing::warn!(path = %path, error = %err, "watchdog lost connection");
                        if !self.reconnect().await {
                            break;
                        }
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(path = %path, error = %err, "watchdog failed to check registered node");
                        continue;
                    }
                }
            }

            if self.register_node("watchdog").await.is_none() {
                break;
            }
        }
        tracing::debug!(prefix = %self.advert.path_prefix, "registration watchdog stopped");
    }
}

/// Builder for one advertisement's register/watch/re-register cycle.
pub struct RegistrationEngine {
    inner: Arc<Registration>,
}

impl RegistrationEngine {
    #[must_use]
    pub fn new(
        advert: Advertisement,
        coordinator: Arc<dyn Coordinator>,
        supervisor: Arc<ReconnectSupervisor>,
        registered: Arc<RegisteredPathSet>,
        config: &RegistryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            inner: Arc::new(Registration {
                advert,
                coordinator,
                supervisor,
                registered,
                path: PathState::new(),
                create_gate: Mutex::new(()),
                vacated: Notify::new(),
                state,
                retry_delay: config.register_retry_delay,
                watchdog_interval: config.watchdog_interval,
                cancel,
            }),
        }
    }

    /// Spawn the watch loop and the watchdog. `tracker` is the owner's task
    /// tracker; the handle tracks the two tasks separately as well.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(self, tracker: &TaskTracker) -> RegistrationHandle {
        let tasks = TaskTracker::new();
        tasks.spawn(tracker.track_future(Arc::clone(&self.inner).run_watch_loop()));
        tasks.spawn(tracker.track_future(Arc::clone(&self.inner).run_watchdog()));
        tasks.close();
        RegistrationHandle {
            inner: self.inner,
            tasks,
        }
    }
}

/// Handle to a running registration.
#[derive(Clone)]
pub struct RegistrationHandle {
    inner: Arc<Registration>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for RegistrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("prefix", &self.inner.advert.path_prefix)
            .field("path", &self.inner.path.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RegistrationHandle {
    #[must_use]
    pub fn advertisement(&self) -> &Advertisement {
        &self.inner.advert
    }

    /// Path of the live node, `None` while (re-)registering.
    #[must_use]
    pub fn current_path(&self) -> Option<String> {
        self.inner.path.get()
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        *self.inner.state.borrow()
    }

    /// Receiver of state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.inner.state.subscribe()
    }

    /// Stop both loops at their next wait. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until both loops have exited.
    pub async fn stopped(&self) {
        self.tasks.wait().await;
    }
}
