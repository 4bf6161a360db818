//! Discovery engine: watches a service path and publishes full membership
//! snapshots.
//!
//! A watch loop re-reads the membership after every children-watch fire and
//! publishes unconditionally. A poll loop re-reads it on a fixed period and
//! publishes only when the set of member names changed, covering watch
//! notifications that were never delivered. Both write into one latest-value
//! slot: producers never block, and a slow consumer sees the newest snapshot.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RegistryConfig;
use crate::coordinator::{CoordinationError, Coordinator, child_path};
use crate::reconnect::{Recovery, ReconnectSupervisor};
use crate::retry::{self, Backoff, Fault};
use crate::sequencer::order_by_sequence;

/// One live node under a service path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMember {
    /// Child node name, e.g. `node-0000000004`.
    pub name: String,
    pub payload: Bytes,
}

/// Full membership of a service path, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySnapshot {
    pub path: String,
    pub members: Vec<ServiceMember>,
}

impl DiscoverySnapshot {
    #[must_use]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }
}

/// A membership update delivered to consumers.
///
/// Always a full replacement of the previous view, never a delta. A set
/// `error` marks a degraded view: the path could not be read and `members`
/// is the last membership seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub path: String,
    pub error: Option<CoordinationError>,
    pub members: Vec<ServiceMember>,
}

impl DiscoveryEvent {
    #[must_use]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    /// Payloads aligned with [`names`](Self::names).
    #[must_use]
    pub fn payloads(&self) -> impl Iterator<Item = &Bytes> {
        self.members.iter().map(|m| &m.payload)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

impl From<DiscoverySnapshot> for DiscoveryEvent {
    fn from(snapshot: DiscoverySnapshot) -> Self {
        Self {
            path: snapshot.path,
            error: None,
            members: snapshot.members,
        }
    }
}

/// Remembers the last member-name set and reports whether a new one differs.
///
/// Differs means a different size or at least one name not seen last time.
/// Reordering never counts as a change.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    known: HashSet<String>,
}

impl MembershipTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `names` as the current membership; `true` if it changed.
    pub fn observe<'a, I>(&mut self, names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let current: HashSet<String> = names.into_iter().map(str::to_owned).collect();
        let changed =
            current.len() != self.known.len() || current.iter().any(|n| !self.known.contains(n));
        self.known = current;
        changed
    }
}

/// Read the membership of `path` once.
///
/// Children are ordered by sequence suffix and read one by one. A child that
/// disappears between listing and reading is skipped; any other failure
/// aborts the whole read.
///
/// # Errors
/// Returns the first listing or read error other than a vanished child.
pub async fn fetch_snapshot(
    coordinator: &dyn Coordinator,
    path: &str,
) -> Result<DiscoverySnapshot, CoordinationError> {
    let children = coordinator.children(path).await?;
    let ordered = order_by_sequence(&children);

    let mut members = Vec::with_capacity(ordered.len());
    for name in ordered {
        let node = child_path(path, &name);
        match coordinator.get(&node).await {
            Ok(payload) => members.push(ServiceMember { name, payload }),
            Err(CoordinationError::NoNode) => {
                tracing::debug!(path = %node, "service node vanished before it was read");
            }
            Err(err) => return Err(err),
        }
    }

    Ok(DiscoverySnapshot {
        path: path.to_owned(),
        members,
    })
}

/// Receiving side of a discovery.
///
/// Holds only the newest unseen event; intermediate events a slow consumer
/// missed are superseded, which is safe because every event is a full
/// snapshot.
#[derive(Debug)]
pub struct DiscoveryEvents {
    rx: watch::Receiver<Option<DiscoveryEvent>>,
}

impl DiscoveryEvents {
    /// Next unseen event, or `None` once the discovery has stopped and
    /// every event was consumed.
    pub async fn recv(&mut self) -> Option<DiscoveryEvent> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    /// Most recent event without waiting, seen or not.
    #[must_use]
    pub fn latest(&self) -> Option<DiscoveryEvent> {
        self.rx.borrow().clone()
    }
}

struct Discovery {
    path: String,
    coordinator: Arc<dyn Coordinator>,
    supervisor: Arc<ReconnectSupervisor>,
    events: watch::Sender<Option<DiscoveryEvent>>,
    backoff: Backoff,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Discovery {
    fn publish(&self, event: DiscoveryEvent) {
        self.events.send_replace(Some(event));
    }

    fn publish_degraded(&self, error: CoordinationError) {
        let members = self
            .events
            .borrow()
            .as_ref()
            .map(|e| e.members.clone())
            .unwrap_or_default();
        self.publish(DiscoveryEvent {
            path: self.path.clone(),
            error: Some(error),
            members,
        });
    }

    async fn fetch(&self) -> Option<DiscoverySnapshot> {
        let coordinator = self.coordinator.as_ref();
        let path = self.path.as_str();
        retry::retry_forever(
            "fetch_snapshot",
            &self.cancel,
            &self.supervisor,
            self.backoff,
            move || fetch_snapshot(coordinator, path),
        )
        .await
    }

    async fn run_watch_loop(self: Arc<Self>) {
        tracing::info!(path = %self.path, "discovering service by watching children");

        while !self.cancel.is_cancelled() {
            let watch = match self.coordinator.children_watch(&self.path).await {
                Ok((_, watch)) => watch,
                Err(err) => {
                    let fault = Fault::classify(&err);
                    tracing::warn!(path = %self.path, error = %err, ?fault, "failed to watch service children");
                    if fault != Fault::ConnectionLost {
                        self.publish_degraded(err);
                    }
                    if !retry::recover(fault, self.backoff, &self.supervisor, &self.cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(snapshot) = self.fetch().await else {
                break;
            };
            self.publish(snapshot.into());

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = watch.fired() => {
                    tracing::debug!(path = %self.path, ?event, "service children changed");
                    if event.is_disconnect()
                        && self.supervisor.reconnect(&self.cancel).await == Recovery::Cancelled
                    {
                        break;
                    }
                }
            }
        }
        tracing::info!(path = %self.path, "service discovery stopped");
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let mut tracker = MembershipTracker::new();
        loop {
            let Some(snapshot) = self.fetch().await else {
                break;
            };
            if tracker.observe(snapshot.names()) {
                tracing::debug!(
                    path = %self.path,
                    members = snapshot.members.len(),
                    "membership change found by poll"
                );
                self.publish(snapshot.into());
            }
            if !retry::pause(&self.cancel, self.poll_interval).await {
                break;
            }
        }
        tracing::debug!(path = %self.path, "discovery poll stopped");
    }
}

/// Builder for the discovery of one service path.
pub struct DiscoveryEngine {
    inner: Arc<Discovery>,
    rx: watch::Receiver<Option<DiscoveryEvent>>,
}

impl DiscoveryEngine {
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        coordinator: Arc<dyn Coordinator>,
        supervisor: Arc<ReconnectSupervisor>,
        config: &RegistryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (events, rx) = watch::channel(None);
        Self {
            inner: Arc::new(Discovery {
                path: path.into(),
                coordinator,
                supervisor,
                events,
                backoff: Backoff {
                    node_missing: config.discovery_missing_path_delay,
                    transient: config.discovery_error_delay,
                },
                poll_interval: config.discovery_poll_interval,
                cancel,
            }),
            rx,
        }
    }

    /// Spawn the watch and poll loops on `tracker`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(self, tracker: &TaskTracker) -> DiscoveryEvents {
        tracker.spawn(Arc::clone(&self.inner).run_watch_loop());
        tracker.spawn(self.inner.run_poll_loop());
        DiscoveryEvents { rx: self.rx }
    }
}
