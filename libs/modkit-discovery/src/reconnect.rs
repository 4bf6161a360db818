//! Serialized session recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::coordinator::Coordinator;
use crate::retry::pause;

/// Result of a [`ReconnectSupervisor::reconnect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The session answered a ping; nothing was done.
    AlreadyHealthy,
    /// A new session was established by this call.
    Reconnected,
    /// Cancelled before the session became healthy.
    Cancelled,
}

/// Recovers the coordination session, one attempt in flight at a time.
///
/// Concurrent callers queue on an async lock; whoever gets it after a
/// successful recovery finds the session healthy and returns immediately.
/// Failed attempts are retried forever, so callers only ever see a healthy
/// session or cancellation.
pub struct ReconnectSupervisor {
    coordinator: Arc<dyn Coordinator>,
    gate: Mutex<()>,
    session_timeout: Duration,
    retry_delay: Duration,
    settle_delay: Duration,
    invocations: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("session_timeout", &self.session_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("settle_delay", &self.settle_delay)
            .field("invocations", &self.invocations())
            .field("connect_attempts", &self.connect_attempts())
            .finish_non_exhaustive()
    }
}

impl ReconnectSupervisor {
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>, config: &RegistryConfig) -> Self {
        Self {
            coordinator,
            gate: Mutex::new(()),
            session_timeout: config.session_timeout,
            retry_delay: config.reconnect_retry_delay,
            settle_delay: config.reconnect_settle_delay,
            invocations: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        }
    }

    /// Number of `reconnect` calls so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls issued so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Block until the session is healthy or `cancel` fires.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Recovery {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Recovery::Cancelled,
            guard = self.gate.lock() => guard,
        };

        let mut attempt: u32 = 0;
        loop {
            if self.coordinator.ping().await.is_ok() {
                tracing::debug!(attempt, "coordination session is healthy, skipping reconnect");
                return Recovery::AlreadyHealthy;
            }

            attempt += 1;
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            match self.coordinator.connect(self.session_timeout).await {
                Ok(()) => {
                    if !pause(cancel, self.settle_delay).await {
                        return Recovery::Cancelled;
                    }
                    tracing::info!(attempt, "reconnected to coordination service");
                    return Recovery::Reconnected;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        retry_in = ?self.retry_delay,
                        "reconnect to coordination service failed"
                    );
                    if !pause(cancel, self.retry_delay).await {
                        return Recovery::Cancelled;
                    }
                }
            }
        }
    }
}
