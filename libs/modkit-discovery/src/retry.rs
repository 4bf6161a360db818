//! Never-give-up retry of coordination operations.
//!
//! Every loop in the registrar handles failures the same way: recover the
//! session on connection loss, otherwise wait a fixed delay chosen by the
//! error class, then try again. Cancellation interrupts every wait.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::coordinator::CoordinationError;
use crate::reconnect::{Recovery, ReconnectSupervisor};

/// How a failed coordination operation is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Session or connection lost: reconnect, then retry at once.
    ConnectionLost,
    /// The addressed node is missing.
    NodeMissing,
    /// Anything else: retry after a fixed delay.
    Transient,
}

impl Fault {
    #[must_use]
    pub fn classify(err: &CoordinationError) -> Self {
        if err.is_connection_error() {
            Self::ConnectionLost
        } else if matches!(err, CoordinationError::NoNode) {
            Self::NodeMissing
        } else {
            Self::Transient
        }
    }
}

/// Fixed delays per fault class. Connection loss has no delay of its own;
/// the reconnect supervisor paces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub node_missing: Duration,
    pub transient: Duration,
}

impl Backoff {
    /// Same delay for every non-connection fault.
    #[must_use]
    pub const fn flat(delay: Duration) -> Self {
        Self {
            node_missing: delay,
            transient: delay,
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Apply the recovery action for `fault`. Returns `false` on cancellation.
pub async fn recover(
    fault: Fault,
    backoff: Backoff,
    supervisor: &ReconnectSupervisor,
    cancel: &CancellationToken,
) -> bool {
    match fault {
        Fault::ConnectionLost => supervisor.reconnect(cancel).await != Recovery::Cancelled,
        Fault::NodeMissing => pause(cancel, backoff.node_missing).await,
        Fault::Transient => pause(cancel, backoff.transient).await,
    }
}

/// Run `op` until it succeeds. Returns `None` only when cancelled.
pub async fn retry_forever<T, F, Fut>(
    operation: &'static str,
    cancel: &CancellationToken,
    supervisor: &ReconnectSupervisor,
    backoff: Backoff,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoordinationError>>,
{
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match op().await {
            Ok(value) => return Some(value),
            Err(err) => {
                let fault = Fault::classify(&err);
                tracing::warn!(operation, error = %err, ?fault, "coordination operation failed, retrying");
                if !recover(fault, backoff, supervisor, cancel).await {
                    return None;
                }
            }
        }
    }
}
