//! Background validation and idle removal tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use jca_pool::{
    ConnectionValidator, IdleConnectionRemover, IdleRemovalPool, ListenerState, Pool, PoolConfig,
    ValidatingPool,
};
use jca_spi::Credential;
use jca_testing::{MockConnectionFactory, MockManagedConnection, eventually, mock_pool};

#[derive(Default)]
struct RecordingPool {
    scans: AtomicU64,
}

impl RecordingPool {
    fn scans(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }
}

impl ValidatingPool for RecordingPool {
    fn validate_connections(&self) {
        self.scans.fetch_add(1, Ordering::SeqCst);
    }
}

impl IdleRemovalPool for RecordingPool {
    fn remove_idle_connections(&self) {
        self.scans.fetch_add(1, Ordering::SeqCst);
    }
}

fn connection_id(listener: &jca_pool::ConnectionListener) -> u64 {
    listener
        .with_connection(|c| {
            c.as_any()
                .downcast_ref::<MockManagedConnection>()
                .map(MockManagedConnection::id)
        })
        .unwrap()
        .unwrap()
}

// =============================================================================
// Scheduler
// =============================================================================

#[test]
fn test_shorter_registration_shortens_wake_interval() {
    let validator = ConnectionValidator::new();
    let slow = Arc::new(RecordingPool::default());
    let fast = Arc::new(RecordingPool::default());

    validator.register_pool(slow.clone(), Duration::from_millis(1_000));
    assert_eq!(validator.interval(), Some(Duration::from_millis(500)));

    validator.register_pool(fast.clone(), Duration::from_millis(200));
    assert_eq!(validator.interval(), Some(Duration::from_millis(100)));

    thread::sleep(Duration::from_millis(350));
    assert!(fast.scans() >= 2, "only {} passes", fast.scans());
    assert!(
        slow.scans().abs_diff(fast.scans()) <= 1,
        "every pass visits every pool"
    );

    validator.shutdown();
    assert!(!validator.is_running());
}

#[test]
fn test_unregister_restores_interval() {
    let validator = ConnectionValidator::new();
    let slow: Arc<dyn ValidatingPool> = Arc::new(RecordingPool::default());
    let fast: Arc<dyn ValidatingPool> = Arc::new(RecordingPool::default());

    validator.register_pool(Arc::clone(&slow), Duration::from_secs(60));
    validator.register_pool(Arc::clone(&fast), Duration::from_secs(2));
    assert_eq!(validator.interval(), Some(Duration::from_secs(1)));

    validator.unregister_pool(&fast);
    assert_eq!(validator.interval(), Some(Duration::from_secs(30)));
    assert_eq!(validator.pool_count(), 1);

    validator.unregister_pool(&slow);
    assert_eq!(validator.interval(), None);
    assert_eq!(validator.pool_count(), 0);
}

#[test]
fn test_idle_remover_schedules_like_validator() {
    let remover = IdleConnectionRemover::new();
    let pool = Arc::new(RecordingPool::default());

    remover.register_pool(pool.clone(), Duration::from_millis(80));
    assert_eq!(remover.interval(), Some(Duration::from_millis(40)));

    thread::sleep(Duration::from_millis(200));
    assert!(pool.scans() >= 2);
    assert!(remover.passes() >= 2);

    remover.shutdown();
    let after = pool.scans();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.scans(), after, "no passes after shutdown");
}

// =============================================================================
// Pool integration
// =============================================================================

fn validating_config(interval_ms: u64) -> PoolConfig {
    PoolConfig::new()
        .id("validated")
        .max_size(3)
        .blocking_timeout(Duration::from_millis(100))
        .background_validation(Duration::from_millis(interval_ms))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_validation_destroys_invalid_free_connections() {
    let factory = MockConnectionFactory::new();
    let pool = mock_pool(validating_config(50), &factory, None).unwrap();
    let cred = Credential::principal("app");

    let busy = pool.get_connection_listener(&cred).await.unwrap();
    let idle = pool.get_connection_listener(&cred).await.unwrap();
    pool.return_connection_listener(&idle, false);
    factory.set_all_invalid(true);

    let removed = eventually(Duration::from_secs(2), || idle.is_destroyed()).await;
    assert!(removed, "invalid free connection survived background validation");
    assert_eq!(busy.state(), ListenerState::InUse, "in-use connections are not validated");

    let metrics = pool.metrics();
    assert!(metrics.validations_failed >= 1);
    assert_eq!(pool.available_permits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_validation_keeps_valid_connections() {
    let factory = MockConnectionFactory::new();
    let pool = mock_pool(validating_config(40), &factory, None).unwrap();
    let cred = Credential::principal("app");

    let listener = pool.get_connection_listener(&cred).await.unwrap();
    pool.return_connection_listener(&listener, false);

    let validated = eventually(Duration::from_secs(2), || factory.validations() >= 2).await;
    assert!(validated);
    assert_eq!(listener.state(), ListenerState::Free);
    assert_eq!(factory.destroyed(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_validator_tracks_pools() {
    let validator = Arc::new(ConnectionValidator::new());
    let build = |factory: &MockConnectionFactory| -> Pool {
        Pool::builder()
            .pool_config(validating_config(60_000))
            .factory(Arc::new(factory.clone()))
            .validator(Arc::clone(&validator))
            .build()
            .unwrap()
    };
    let first = build(&MockConnectionFactory::new());
    let second = build(&MockConnectionFactory::new());
    let cred = Credential::principal("app");

    let a = first.get_connection_listener(&cred).await.unwrap();
    let b = second.get_connection_listener(&cred).await.unwrap();
    assert_eq!(validator.pool_count(), 2);
    assert_eq!(validator.interval(), Some(Duration::from_secs(30)));

    first.return_connection_listener(&a, false);
    first.shutdown();
    assert_eq!(validator.pool_count(), 1);

    second.return_connection_listener(&b, false);
    drop(second);
    assert_eq!(validator.pool_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_validating_factory_is_not_scanned() {
    let validator = Arc::new(ConnectionValidator::new());
    let factory = MockConnectionFactory::non_validating();
    let pool = Pool::builder()
        .pool_config(validating_config(100))
        .factory(Arc::new(factory.clone()))
        .validator(Arc::clone(&validator))
        .build()
        .unwrap();

    let _listener = pool
        .get_connection_listener(&Credential::principal("app"))
        .await
        .unwrap();
    assert_eq!(validator.pool_count(), 0);
}

// =============================================================================
// Validate on match
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_validate_on_match_replaces_invalid_connection() {
    let factory = MockConnectionFactory::new();
    let config = PoolConfig::new()
        .max_size(2)
        .blocking_timeout(Duration::from_millis(100))
        .validate_on_match(true);
    let pool = mock_pool(config, &factory, None).unwrap();
    let cred = Credential::principal("app");

    let first = pool.get_connection_listener(&cred).await.unwrap();
    factory.invalidate(connection_id(&first));
    pool.return_connection_listener(&first, false);

    let second = pool.get_connection_listener(&cred).await.unwrap();
    assert_ne!(second.id(), first.id());
    assert!(first.is_destroyed());
    assert_eq!(factory.created(), 2);
    assert_eq!(pool.metrics().validations_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_fail_stops_scanning_after_first_invalid() {
    let factory = MockConnectionFactory::new();
    let config = PoolConfig::new()
        .max_size(3)
        .blocking_timeout(Duration::from_millis(100))
        .validate_on_match(true)
        .use_fast_fail(true);
    let pool = mock_pool(config, &factory, None).unwrap();
    let cred = Credential::principal("app");

    let a = pool.get_connection_listener(&cred).await.unwrap();
    let b = pool.get_connection_listener(&cred).await.unwrap();
    factory.invalidate(connection_id(&a));
    factory.invalidate(connection_id(&b));
    pool.return_connection_listener(&a, false);
    pool.return_connection_listener(&b, false);

    let fresh = pool.get_connection_listener(&cred).await.unwrap();
    assert_ne!(fresh.id(), a.id());
    assert_ne!(fresh.id(), b.id());
    assert_eq!(factory.destroyed(), 1, "scan stopped at the first invalid connection");
    assert_eq!(factory.validations(), 1);
}

// =============================================================================
// Idle removal
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_connections_are_removed() {
    let factory = MockConnectionFactory::new();
    let config = PoolConfig::new()
        .max_size(2)
        .blocking_timeout(Duration::from_millis(100))
        .idle_timeout(Some(Duration::from_millis(100)));
    let pool = mock_pool(config, &factory, None).unwrap();
    let cred = Credential::principal("app");

    let listener = pool.get_connection_listener(&cred).await.unwrap();
    pool.return_connection_listener(&listener, false);

    let removed = eventually(Duration::from_secs(2), || listener.is_destroyed()).await;
    assert!(removed, "idle connection was not removed");
    assert_eq!(pool.metrics().idle_timeouts, 1);
    assert_eq!(pool.available_permits(), 2);
    assert!(
        eventually(Duration::from_secs(1), || pool.sub_pool_count() == 0).await,
        "empty sub-pool was not retired"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_removal_keeps_prefilled_minimum() {
    let factory = MockConnectionFactory::new();
    let config = PoolConfig::new()
        .max_size(3)
        .min_size(2)
        .prefill(true)
        .blocking_timeout(Duration::from_millis(100))
        .idle_timeout(Some(Duration::from_millis(60)));
    let pool = mock_pool(config, &factory, None).unwrap();
    let prefill = Credential::default();

    assert!(
        eventually(Duration::from_secs(2), || {
            pool.managed_pool(&prefill).is_some_and(|s| s.free_count() == 2)
        })
        .await
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(factory.destroyed(), 0);
    assert_eq!(pool.managed_pool(&prefill).unwrap().free_count(), 2);
}
