#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Registration lifecycle against the in-memory coordination backend:
//! - re-creation after deletion, exactly once
//! - watchdog recovery when a watch notification is lost
//! - reconnect on connection loss and session expiry
//! - cancellation

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, timeout};

use modkit_discovery::backends::{InMemoryCoordinator, Operation};
use modkit_discovery::{
    CoordinationError, Coordinator, RegistrationHandle, RegistrationState, RegistryConfig,
    ServiceRegistry, Watch,
};

const PREFIX: &str = "/services/api/node-";

fn registry(zk: &Arc<InMemoryCoordinator>) -> ServiceRegistry {
    ServiceRegistry::new(zk.clone(), RegistryConfig::default()).unwrap()
}

/// Forwards to the in-memory backend and records session and create calls.
struct Recording {
    inner: Arc<InMemoryCoordinator>,
    calls: Mutex<Vec<&'static str>>,
    exists_watch_calls: AtomicUsize,
}

impl Recording {
    fn new(inner: Arc<InMemoryCoordinator>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            exists_watch_calls: AtomicUsize::new(0),
        }
    }

    fn record<T>(
        &self,
        ok: &'static str,
        loss: &'static str,
        err: &'static str,
        res: &Result<T, CoordinationError>,
    ) {
        let label = match res {
            Ok(_) => ok,
            Err(CoordinationError::ConnectionLoss) => loss,
            Err(_) => err,
        };
        self.calls.lock().push(label);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Coordinator for Recording {
    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        payload: Bytes,
    ) -> Result<String, CoordinationError> {
        let res = self.inner.create_ephemeral_sequential(prefix, payload).await;
        self.record("create(Ok)", "create(ConnectionLoss)", "create(Err)", &res);
        res
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        self.inner.exists(path).await
    }

    async fn exists_watch(&self, path: &str) -> Result<(bool, Watch), CoordinationError> {
        self.exists_watch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists_watch(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.inner.children(path).await
    }

    async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), CoordinationError> {
        self.inner.children_watch(path).await
    }

    async fn get(&self, path: &str) -> Result<Bytes, CoordinationError> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        self.inner.delete(path, version).await
    }

    async fn ping(&self) -> Result<(), CoordinationError> {
        let res = self.inner.ping().await;
        self.record("ping(Ok)", "ping(ConnectionLoss)", "ping(Err)", &res);
        res
    }

    async fn connect(&self, session_timeout: Duration) -> Result<(), CoordinationError> {
        let res = self.inner.connect(session_timeout).await;
        self.record("connect(Ok)", "connect(ConnectionLoss)", "connect(Err)", &res);
        res
    }
}

/// Wait until the registration watches a path other than `previous`.
async fn watching_path(handle: &RegistrationHandle, previous: Option<&str>) -> String {
    timeout(Duration::from_secs(60), async {
        loop {
            if handle.state() == RegistrationState::Watching
                && let Some(path) = handle.current_path()
                && previous != Some(path.as_str())
            {
                return path;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration did not settle")
}

#[tokio::test(start_paused = true)]
async fn registers_node_with_payload() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);

    let handle = registry.register(PREFIX, "10.0.0.1:8080").unwrap();
    let path = watching_path(&handle, None).await;

    assert_eq!(path, "/services/api/node-0000000000");
    assert!(zk.contains(&path));
    assert_eq!(registry.registered_paths(), vec![path]);
    assert_eq!(handle.advertisement().path_prefix, PREFIX);
    assert_eq!(zk.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn state_changes_are_observable() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);
    let handle = registry.register(PREFIX, "payload").unwrap();
    let mut states = handle.subscribe();

    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == RegistrationState::Watching),
    )
    .await
    .unwrap()
    .unwrap();

    handle.cancel();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == RegistrationState::Cancelled),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn deleted_node_is_recreated_exactly_once() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);
    let handle = registry.register(PREFIX, "payload").unwrap();
    let first = watching_path(&handle, None).await;

    zk.evict(&first);
    let second = watching_path(&handle, Some(&first)).await;

    // let both loops run a few more rounds
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(zk.create_calls(), 2);
    assert_eq!(zk.child_names("/services/api"), vec!["node-0000000001"]);
    assert_eq!(handle.current_path(), Some(second.clone()));
    assert_eq!(registry.registered_paths(), vec![second]);
}

#[tokio::test(start_paused = true)]
async fn re_registration_watches_new_node_once() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let recording = Arc::new(Recording::new(zk.clone()));
    let registry = ServiceRegistry::new(recording.clone(), RegistryConfig::default()).unwrap();
    let handle = registry.register(PREFIX, "payload").unwrap();
    let first = watching_path(&handle, None).await;
    assert_eq!(recording.exists_watch_calls.load(Ordering::SeqCst), 1);

    zk.evict(&first);
    watching_path(&handle, Some(&first)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    // fired watch, re-check of the vacated path, watch on the new node
    assert_eq!(recording.exists_watch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(zk.pending_watches(), 1);
}

#[tokio::test(start_paused = true)]
async fn watchdog_recreates_node_when_watch_is_lost() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);
    let handle = registry.register(PREFIX, "payload").unwrap();
    let first = watching_path(&handle, None).await;

    zk.suppress_watches(true);
    zk.evict(&first);
    let started = Instant::now();
    let second = watching_path(&handle, Some(&first)).await;

    assert!(started.elapsed() < Duration::from_millis(1100));
    assert!(zk.contains(&second));
    assert_eq!(zk.create_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn unwatchable_node_is_replaced() {
    let zk = Arc::new(InMemoryCoordinator::new());
    zk.fail_next(Operation::Exists, CoordinationError::Other("boom".to_owned()));
    let registry = registry(&zk);

    let handle = registry.register(PREFIX, "payload").unwrap();
    let path = watching_path(&handle, None).await;

    assert_eq!(path, "/services/api/node-0000000001");
    assert!(!zk.contains("/services/api/node-0000000000"));
    assert_eq!(zk.create_calls(), 2);
    assert_eq!(zk.delete_calls(), 1);
    assert_eq!(registry.registered_paths(), vec![path]);
}

#[tokio::test(start_paused = true)]
async fn connection_loss_on_create_reconnects_once() {
    let zk = Arc::new(InMemoryCoordinator::new());
    zk.disconnect();
    let recording = Arc::new(Recording::new(zk.clone()));
    let registry = ServiceRegistry::new(recording.clone(), RegistryConfig::default()).unwrap();

    let handle = registry.register(PREFIX, "payload").unwrap();
    let path = watching_path(&handle, None).await;

    assert!(zk.contains(&path));
    assert_eq!(zk.connect_calls(), 1);
    assert_eq!(zk.create_calls(), 2);
    assert_eq!(registry.supervisor().invocations(), 1);
    assert_eq!(
        recording.calls(),
        vec![
            "create(ConnectionLoss)",
            "ping(ConnectionLoss)",
            "connect(Ok)",
            "create(Ok)"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn expired_session_re_registers() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);
    let handle = registry.register(PREFIX, "payload").unwrap();
    let first = watching_path(&handle, None).await;

    zk.expire_session();
    let second = watching_path(&handle, Some(&first)).await;

    assert!(!zk.contains(&first));
    assert!(zk.contains(&second));
    assert_eq!(zk.connect_calls(), 1);
    assert_eq!(registry.registered_paths(), vec![second]);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_both_loops() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);
    let handle = registry.register(PREFIX, "payload").unwrap();
    let path = watching_path(&handle, None).await;

    handle.cancel();
    timeout(Duration::from_secs(5), handle.stopped())
        .await
        .expect("registration loops did not stop");

    assert!(handle.is_cancelled());
    assert_eq!(handle.state(), RegistrationState::Cancelled);
    assert!(!registry.is_cancelled());

    // no re-registration once stopped
    zk.evict(&path);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(zk.create_calls(), 1);
    assert!(zk.child_names("/services/api").is_empty());
}

#[tokio::test(start_paused = true)]
async fn registry_shutdown_stops_every_registration() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = registry(&zk);
    let api = registry.register(PREFIX, "api").unwrap();
    let jobs = registry.register("/services/jobs/node-", "jobs").unwrap();
    watching_path(&api, None).await;
    watching_path(&jobs, None).await;

    timeout(Duration::from_secs(5), registry.shutdown())
        .await
        .expect("registry did not shut down");

    assert_eq!(api.state(), RegistrationState::Cancelled);
    assert_eq!(jobs.state(), RegistrationState::Cancelled);
    assert!(registry.register(PREFIX, "late").is_err());
}
