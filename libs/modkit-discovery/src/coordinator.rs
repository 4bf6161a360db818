//! Capability surface required from the coordination-service client.
//!
//! The registrar never talks to a wire protocol directly. Anything that can
//! create ephemeral sequential nodes, answer existence/children queries and
//! deliver one-shot watches can back it: a real `ZooKeeper` session, or the
//! in-process [`InMemoryCoordinator`](crate::backends::memory::InMemoryCoordinator).

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors reported by a [`Coordinator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoordinationError {
    /// The connection to the service dropped; the session may still be alive.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// The session expired; every ephemeral node it owned is gone.
    #[error("coordination session expired")]
    SessionExpired,

    /// The client was closed and must reconnect before further use.
    #[error("coordination client is closed")]
    Closed,

    /// The addressed node does not exist.
    #[error("node does not exist")]
    NoNode,

    /// A node with the same path already exists.
    #[error("node already exists")]
    NodeExists,

    /// Conditional delete with a stale version.
    #[error("node version mismatch")]
    BadVersion,

    /// Anything the registrar does not classify further.
    #[error("coordination service error: {0}")]
    Other(String),
}

impl CoordinationError {
    /// Whether the error means the session/connection must be recovered before
    /// any further operation can be trusted.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::SessionExpired | Self::Closed)
    }
}

/// What changed on the watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// Session state change without a node change.
    Session,
}

/// Session state carried by a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

/// A single watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub state: SessionState,
}

impl WatchEvent {
    #[must_use]
    pub const fn node(kind: WatchEventKind) -> Self {
        Self {
            kind,
            state: SessionState::Connected,
        }
    }

    #[must_use]
    pub const fn session(state: SessionState) -> Self {
        Self {
            kind: WatchEventKind::Session,
            state,
        }
    }

    /// The session was lost; the caller must reconnect before re-watching.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self.state, SessionState::Disconnected | SessionState::Expired)
    }
}

/// One-shot watch handle returned by the `*_watch` operations.
///
/// A watch fires at most once. If the backend drops it without firing (client
/// closed, session torn down) it resolves as a disconnect.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

/// Backend side of a [`Watch`].
pub type WatchTrigger = oneshot::Sender<WatchEvent>;

impl Watch {
    /// Create a connected trigger/watch pair.
    #[must_use]
    pub fn channel() -> (WatchTrigger, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the notification.
    pub async fn fired(self) -> WatchEvent {
        self.rx
            .await
            .unwrap_or(WatchEvent::session(SessionState::Disconnected))
    }
}

/// Coordination-service operations used by registration and discovery.
///
/// Paths are absolute, `/`-separated. Implementations create missing parent
/// nodes (as persistent nodes) for [`create_ephemeral_sequential`].
///
/// [`create_ephemeral_sequential`]: Coordinator::create_ephemeral_sequential
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Create `<prefix><10-digit sequence>` owned by the current session and
    /// return the assigned path.
    ///
    /// # Errors
    /// Connection errors, or [`CoordinationError::Other`] for a bad prefix.
    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        payload: Bytes,
    ) -> Result<String, CoordinationError>;

    /// # Errors
    /// Connection errors only; a missing node is `Ok(false)`.
    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Like [`exists`](Coordinator::exists) but also installs an existence watch.
    ///
    /// # Errors
    /// Same as [`exists`](Coordinator::exists); no watch is installed on error.
    async fn exists_watch(&self, path: &str) -> Result<(bool, Watch), CoordinationError>;

    /// Child names (not full paths) of `path`.
    ///
    /// # Errors
    /// [`CoordinationError::NoNode`] if `path` does not exist, or a connection error.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Like [`children`](Coordinator::children) but also installs a children watch.
    ///
    /// # Errors
    /// Same as [`children`](Coordinator::children).
    async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), CoordinationError>;

    /// Payload of `path`.
    ///
    /// # Errors
    /// [`CoordinationError::NoNode`] if `path` does not exist, or a connection error.
    async fn get(&self, path: &str) -> Result<Bytes, CoordinationError>;

    /// Delete `path`. `None` matches any version.
    ///
    /// # Errors
    /// [`CoordinationError::NoNode`], [`CoordinationError::BadVersion`], or a
    /// connection error.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError>;

    /// Cheap round trip proving the session is usable.
    ///
    /// # Errors
    /// Any connection error.
    async fn ping(&self) -> Result<(), CoordinationError>;

    /// Re-establish the connection, starting a new session if the old one
    /// expired.
    ///
    /// # Errors
    /// Any error preventing a usable session.
    async fn connect(&self, session_timeout: Duration) -> Result<(), CoordinationError>;
}

/// Join a parent path and a child name.
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}
