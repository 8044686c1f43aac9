//! Connection manager and handle tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use jca_pool::{ConnectionManager, ListenerState, PoolConfig, PoolError};
use jca_spi::Credential;
use jca_testing::{MockConnectionFactory, MockManagedConnection, mock_pool};

fn manager(config: PoolConfig) -> (MockConnectionFactory, ConnectionManager) {
    let factory = MockConnectionFactory::new();
    let pool = mock_pool(config, &factory, None).unwrap();
    (factory, ConnectionManager::new(pool))
}

fn config(max: u32) -> PoolConfig {
    PoolConfig::new()
        .id("cm")
        .max_size(max)
        .blocking_timeout(Duration::from_millis(50))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handle_reaches_physical_connection() {
    let (factory, manager) = manager(config(2));
    let handle = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();

    let (id, open) = handle
        .with_connection(|c: &mut MockManagedConnection| (c.id(), c.open_handles()))
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(open, 1);
    assert_eq!(factory.handles_opened(), 1);
    assert!(!handle.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_connection_type_is_reported() {
    let (_factory, manager) = manager(config(2));
    let handle = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();

    let err = handle.with_connection(|_: &mut String| ()).unwrap_err();
    match err {
        PoolError::ConnectionType { expected } => assert!(expected.contains("String")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_and_drop_return_listener() {
    let (factory, manager) = manager(config(1));
    let cred = Credential::principal("app");

    let handle = manager.allocate_connection(&cred).await.unwrap();
    let listener = handle.listener().clone();
    handle.close();
    assert_eq!(listener.state(), ListenerState::Free);
    assert_eq!(factory.cleanups(), 1);

    {
        let _handle = manager.allocate_connection(&cred).await.unwrap();
        assert_eq!(listener.state(), ListenerState::InUse);
    }
    assert_eq!(listener.state(), ListenerState::Free);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cleanup_failure_destroys_connection() {
    let (factory, manager) = manager(config(1));
    factory.set_fail_cleanup(true);

    let handle = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = handle.listener().clone();
    handle.close();

    assert!(listener.is_destroyed());
    assert_eq!(manager.pool().available_permits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handle_failure_destroys_connection() {
    let (factory, manager) = manager(config(2));
    factory.set_fail_open_handle(true);

    let err = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Resource(_)));
    assert_eq!(factory.destroyed(), 1);
    assert_eq!(manager.pool().available_permits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocation_retry_outlasts_short_timeout() {
    let (factory, manager) =
        manager(config(1).allocation_retry(3, Duration::from_millis(60)));
    let cred = Credential::principal("app");

    let held = manager.allocate_connection(&cred).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        held.close();
    });

    let handle = manager.allocate_connection(&cred).await.unwrap();
    assert_eq!(handle.listener().state(), ListenerState::InUse);
    assert_eq!(factory.created(), 1);
    assert!(manager.pool().metrics().blocking_failures >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_without_retry_timeout_is_returned() {
    let (_factory, manager) = manager(config(1));
    let cred = Credential::principal("app");

    let _held = manager.allocate_connection(&cred).await.unwrap();
    let err = manager.allocate_connection(&cred).await.unwrap_err();
    assert!(matches!(err, PoolError::NoConnectionAvailable { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_error_releases_capacity() {
    let (factory, manager) = manager(config(1));
    let handle = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = handle.listener().clone();

    handle.connection_error();
    assert!(listener.is_destroyed());
    assert_eq!(factory.destroyed(), 1);
    assert_eq!(manager.pool().available_permits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delist_unenlisted_handle_fails() {
    let (_factory, manager) = manager(config(1));
    let handle = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();

    let err = manager.delist_connection(&handle).unwrap_err();
    assert!(matches!(err, PoolError::IllegalDelistState { .. }));
    assert!(handle.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_rejects_allocation() {
    let (factory, manager) = manager(config(2));
    let handle = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();

    manager.shutdown();
    assert!(manager.is_shut_down());
    assert!(manager.pool().is_shut_down());
    assert!(handle.is_closed());
    assert_eq!(factory.live(), 0);

    let err = manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ManagerShutdown));
}
