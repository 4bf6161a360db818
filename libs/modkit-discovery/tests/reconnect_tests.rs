#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Reconnect serialization: concurrent recoveries share one connect.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use modkit_discovery::backends::InMemoryCoordinator;
use modkit_discovery::{
    Coordinator, ReconnectSupervisor, Recovery, RegistrationState, RegistryConfig,
    ServiceRegistry,
};

#[tokio::test(start_paused = true)]
async fn concurrent_reconnects_connect_once() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let supervisor = ReconnectSupervisor::new(zk.clone(), &RegistryConfig::default());
    zk.disconnect();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(supervisor.reconnect(&cancel), supervisor.reconnect(&cancel));

    let mut outcomes = [a, b];
    outcomes.sort_by_key(|r| *r == Recovery::AlreadyHealthy);
    assert_eq!(outcomes, [Recovery::Reconnected, Recovery::AlreadyHealthy]);
    assert_eq!(zk.connect_calls(), 1);
    assert_eq!(supervisor.invocations(), 2);
    assert_eq!(supervisor.connect_attempts(), 1);
    assert!(zk.ping().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn waiting_caller_is_released_by_cancellation() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let supervisor = Arc::new(ReconnectSupervisor::new(
        zk.clone(),
        &RegistryConfig::default(),
    ));
    zk.disconnect();
    zk.fail_connects(usize::MAX);

    let holder_cancel = CancellationToken::new();
    let holder = tokio::spawn({
        let supervisor = supervisor.clone();
        let cancel = holder_cancel.clone();
        async move { supervisor.reconnect(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waiter_cancel = CancellationToken::new();
    waiter_cancel.cancel();
    assert_eq!(
        supervisor.reconnect(&waiter_cancel).await,
        Recovery::Cancelled
    );

    holder_cancel.cancel();
    assert_eq!(holder.await.unwrap(), Recovery::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn registration_and_discovery_share_one_reconnect() {
    let zk = Arc::new(InMemoryCoordinator::new());
    let registry = ServiceRegistry::new(zk.clone(), RegistryConfig::default()).unwrap();
    let handle = registry.register("/services/api/node-", "payload").unwrap();
    let mut events = registry.discover("/services/api").unwrap();

    timeout(Duration::from_secs(30), async {
        while handle.state() != RegistrationState::Watching {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        while events.recv().await.unwrap().members.is_empty() {}
    })
    .await
    .expect("registration and discovery did not settle");

    zk.disconnect();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(zk.is_connected());
    assert_eq!(zk.connect_calls(), 1);
    assert!(registry.supervisor().invocations() >= 2);
    assert_eq!(handle.state(), RegistrationState::Watching);
    assert_eq!(zk.create_calls(), 1);
}
