//! Transaction enlistment, completion and tracking tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use jca_pool::{
    ConnectionManager, FlushStrategy, ListenerState, PoolConfig, PoolError,
    TransactionSupportLevel,
};
use jca_spi::{
    Credential, Synchronization, Transaction, TransactionError, TransactionKey,
    TransactionStatus, XaFlag, XaResource,
};
use jca_testing::{
    MockConnectionFactory, MockTransaction, MockTransactionManager, XaEvent, init_tracing,
    mock_pool,
};

struct Fixture {
    factory: MockConnectionFactory,
    tm: Arc<MockTransactionManager>,
    manager: ConnectionManager,
}

fn fixture(config: PoolConfig) -> Fixture {
    init_tracing();
    let factory = MockConnectionFactory::new();
    let tm = Arc::new(MockTransactionManager::new());
    let pool = mock_pool(config, &factory, Some(&tm)).unwrap();
    Fixture {
        factory,
        tm,
        manager: ConnectionManager::new(pool),
    }
}

fn config(max: u32) -> PoolConfig {
    PoolConfig::new()
        .id("tx")
        .max_size(max)
        .blocking_timeout(Duration::from_millis(100))
}

fn names(events: &[XaEvent]) -> Vec<&'static str> {
    events.iter().map(XaEvent::name).collect()
}

/// A transaction that accepts every call except delisting.
struct RefusesDelist(Arc<MockTransaction>);

impl Transaction for RefusesDelist {
    fn key(&self) -> TransactionKey {
        self.0.key()
    }

    fn status(&self) -> TransactionStatus {
        self.0.status()
    }

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<bool, TransactionError> {
        self.0.enlist_resource(resource)
    }

    fn delist_resource(
        &self,
        _resource: &Arc<dyn XaResource>,
        _flag: XaFlag,
    ) -> Result<bool, TransactionError> {
        Ok(false)
    }

    fn register_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError> {
        self.0.register_synchronization(sync)
    }

    fn set_rollback_only(&self) -> Result<(), TransactionError> {
        self.0.set_rollback_only()
    }
}

// =============================================================================
// Enlistment and completion
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enlisted_listener_returns_on_commit() {
    let fx = fixture(config(2));
    let tx = fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = Arc::clone(handle.listener());
    assert!(listener.is_enlisted());
    assert_eq!(listener.transaction_key(), Some(tx.key()));

    handle.close();
    assert_eq!(listener.state(), ListenerState::InUse, "enlisted listener stays checked out");

    fx.tm.commit().unwrap();
    assert_eq!(tx.status(), TransactionStatus::Committed);
    assert!(!listener.is_enlisted());
    assert_eq!(listener.state(), ListenerState::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_xa_call_sequence() {
    let fx = fixture(config(2));
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    handle.close();
    fx.tm.commit().unwrap();

    let events = fx.factory.xa_events();
    assert_eq!(names(&events), vec!["start", "end", "prepare", "commit"]);
    assert!(matches!(
        events[0],
        XaEvent::Start {
            flag: XaFlag::NoFlags,
            ..
        }
    ));
    assert!(matches!(
        events[1],
        XaEvent::End {
            flag: XaFlag::Success,
            ..
        }
    ));
    assert!(matches!(
        events[3],
        XaEvent::Commit {
            one_phase: false,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transaction_reuses_its_listener() {
    let fx = fixture(config(2));
    let tx = fx.tm.begin().unwrap();
    let cred = Credential::principal("app");

    let first = fx.manager.allocate_connection(&cred).await.unwrap();
    let second = fx.manager.allocate_connection(&cred).await.unwrap();

    assert_eq!(first.listener().id(), second.listener().id());
    assert_ne!(first.id(), second.id());
    assert_eq!(first.listener().handle_count(), 2);
    assert_eq!(fx.factory.created(), 1);
    assert_eq!(tx.branch_count(), 1);

    let listener = Arc::clone(first.listener());
    first.close();
    second.close();
    fx.tm.commit().unwrap();
    assert_eq!(listener.state(), ListenerState::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_transactions_get_separate_listeners() {
    let fx = fixture(config(2));
    let cred = Credential::principal("app");

    fx.tm.begin().unwrap();
    let first = fx.manager.allocate_connection(&cred).await.unwrap();
    let tx1 = fx.tm.suspend().unwrap();

    fx.tm.begin().unwrap();
    let second = fx.manager.allocate_connection(&cred).await.unwrap();
    assert_ne!(first.listener().id(), second.listener().id());

    second.close();
    fx.tm.commit().unwrap();
    fx.tm.resume(tx1);
    first.close();
    fx.tm.commit().unwrap();
    assert_eq!(fx.factory.created(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollback_returns_listener() {
    let fx = fixture(config(2));
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = Arc::clone(handle.listener());
    handle.close();
    fx.tm.rollback().unwrap();

    assert_eq!(names(&fx.factory.xa_events()), vec!["start", "end", "rollback"]);
    assert_eq!(listener.state(), ListenerState::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_prepare_rolls_back_and_returns_listener() {
    let fx = fixture(config(2));
    fx.factory.set_fail_prepare(true);
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = Arc::clone(handle.listener());
    handle.close();

    assert!(matches!(fx.tm.commit(), Err(TransactionError::RolledBack(_))));
    assert_eq!(
        names(&fx.factory.xa_events()),
        vec!["start", "end", "prepare", "rollback"]
    );
    assert_eq!(listener.state(), ListenerState::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_transaction_support_skips_enlistment() {
    let fx = fixture(config(2).transaction_support(TransactionSupportLevel::NoTransaction));
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    assert!(!handle.listener().is_enlisted());
    let listener = Arc::clone(handle.listener());
    handle.close();

    assert_eq!(listener.state(), ListenerState::Free);
    assert!(fx.factory.xa_events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_delist_releases_on_close() {
    let fx = fixture(config(2));
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    fx.manager.delist_connection(&handle).unwrap();
    assert!(!handle.listener().is_enlisted());

    let listener = Arc::clone(handle.listener());
    handle.close();
    assert_eq!(listener.state(), ListenerState::Free);

    fx.tm.commit().unwrap();
    assert_eq!(
        names(&fx.factory.xa_events()),
        vec!["start", "end", "prepare", "commit"]
    );
}

// =============================================================================
// Illegal states
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_enlist_destroys_listener() {
    let fx = fixture(config(1));
    let pool = fx.manager.pool();
    let listener = pool
        .get_connection_listener(&Credential::principal("app"))
        .await
        .unwrap();

    let tx1 = fx.tm.begin().unwrap();
    listener.enlist(Arc::clone(&tx1) as Arc<dyn Transaction>).unwrap();
    fx.tm.suspend();

    let tx2 = fx.tm.begin().unwrap();
    let err = listener
        .enlist(Arc::clone(&tx2) as Arc<dyn Transaction>)
        .unwrap_err();

    assert!(matches!(
        err,
        PoolError::IllegalEnlistState {
            state: ListenerState::InUse,
            ..
        }
    ));
    assert!(listener.is_destroyed());
    assert_eq!(pool.available_permits(), 1);
    assert_eq!(tx1.status(), TransactionStatus::MarkedRollback);
    assert_eq!(tx2.status(), TransactionStatus::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enlist_destroyed_listener_is_illegal() {
    let fx = fixture(config(1));
    let pool = fx.manager.pool();
    let listener = pool
        .get_connection_listener(&Credential::principal("app"))
        .await
        .unwrap();
    pool.return_connection_listener(&listener, true);

    let tx = fx.tm.begin().unwrap();
    let err = listener.enlist(tx as Arc<dyn Transaction>).unwrap_err();
    assert!(matches!(
        err,
        PoolError::IllegalEnlistState {
            state: ListenerState::Destroyed,
            ..
        }
    ));
    assert_eq!(pool.available_permits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delist_without_enlist_destroys_listener() {
    let fx = fixture(config(1));
    let pool = fx.manager.pool();
    let listener = pool
        .get_connection_listener(&Credential::principal("app"))
        .await
        .unwrap();

    let err = listener.delist().unwrap_err();
    assert!(matches!(err, PoolError::IllegalDelistState { .. }));
    assert!(listener.is_destroyed());
    assert_eq!(pool.available_permits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refused_delist_destroys_listener() {
    let fx = fixture(config(1));
    let pool = fx.manager.pool();
    let cred = Credential::principal("app");
    let listener = pool.get_connection_listener(&cred).await.unwrap();

    let tx = fx.tm.begin().unwrap();
    listener
        .enlist(Arc::new(RefusesDelist(Arc::clone(&tx))) as Arc<dyn Transaction>)
        .unwrap();

    let err = listener.delist().unwrap_err();
    assert!(matches!(err, PoolError::DelistmentFailed { .. }));
    assert!(!listener.is_enlisted());
    assert!(listener.is_destroyed());
    assert_eq!(pool.available_permits(), 1);

    pool.return_connection_listener(&listener, false);
    assert!(listener.is_destroyed());

    let next = pool.get_connection_listener(&cred).await.unwrap();
    assert_ne!(next.id(), listener.id());
    assert_eq!(fx.factory.created(), 2);
    assert_eq!(fx.factory.destroyed(), 1);
    pool.return_connection_listener(&next, false);
    fx.tm.rollback().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_enlistment_failure_destroys_connection() {
    let fx = fixture(config(2));
    fx.factory.set_fail_xa_resource(true);
    fx.tm.begin().unwrap();

    let err = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::EnlistmentFailed { .. }));
    assert_eq!(fx.factory.destroyed(), 1);
    assert_eq!(fx.manager.pool().available_permits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollback_only_transaction_refuses_enlistment() {
    let fx = fixture(config(2));
    let tx = fx.tm.begin().unwrap();
    tx.set_rollback_only().unwrap();

    let err = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::EnlistmentFailed { .. }));
    assert_eq!(fx.manager.pool().available_permits(), 2);
}

// =============================================================================
// Handle tracking
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_handle_at_completion_is_killed() {
    let fx = fixture(config(2));
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = Arc::clone(handle.listener());

    fx.tm.commit().unwrap();

    assert!(listener.is_destroyed());
    assert!(handle.is_closed());
    assert!(matches!(
        handle.with_connection(|_: &mut jca_testing::MockManagedConnection| ()),
        Err(PoolError::HandleClosed)
    ));
    assert_eq!(fx.manager.pool().available_permits(), 2);
    drop(handle);
    assert_eq!(fx.factory.destroyed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_open_handle_survives_without_tracking() {
    let fx = fixture(config(2).tracking(false));
    fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    let listener = Arc::clone(handle.listener());

    fx.tm.commit().unwrap();
    assert!(!listener.is_destroyed());
    assert!(!listener.is_enlisted());
    assert_eq!(listener.state(), ListenerState::InUse);

    handle.close();
    assert_eq!(listener.state(), ListenerState::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_commit_releases_checkout_once() {
    let fx = fixture(config(1).tracking(false));
    let cred = Credential::principal("app");

    for _ in 0..100 {
        let tx = fx.tm.begin().unwrap();
        let handle = fx.manager.allocate_connection(&cred).await.unwrap();
        let listener = Arc::clone(handle.listener());
        fx.tm.suspend();

        // Waits for the listener, then holds it long enough for a stray
        // second release to show up as a state change.
        let pool = fx.manager.pool().clone();
        let next_cred = cred.clone();
        let next = tokio::spawn(async move {
            let next = pool.get_connection_listener(&next_cred).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            let state = next.state();
            pool.return_connection_listener(&next, false);
            state
        });

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let closer = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                handle.close();
            })
        };
        barrier.wait();
        tx.commit().unwrap();
        closer.join().unwrap();

        assert_eq!(
            next.await.unwrap(),
            ListenerState::InUse,
            "listener released while checked out"
        );
        assert_eq!(listener.state(), ListenerState::Free);
        assert_eq!(fx.manager.pool().available_permits(), 0);
    }

    assert_eq!(fx.factory.created(), 1);
    assert_eq!(fx.factory.destroyed(), 0);
}

// =============================================================================
// Connection errors
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_error_destroys_only_failing_connection() {
    let fx = fixture(config(3));
    let cred = Credential::principal("app");

    let failing = fx.manager.allocate_connection(&cred).await.unwrap();
    let idle = fx.manager.allocate_connection(&cred).await.unwrap();
    let idle_listener = Arc::clone(idle.listener());
    idle.close();

    failing.connection_error();

    assert_eq!(fx.factory.destroyed(), 1);
    assert_eq!(idle_listener.state(), ListenerState::Free);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_error_flushes_idle_connections() {
    let fx = fixture(config(3).flush_strategy(FlushStrategy::IdleConnections));
    let cred = Credential::principal("app");

    let failing = fx.manager.allocate_connection(&cred).await.unwrap();
    let busy = fx.manager.allocate_connection(&cred).await.unwrap();
    let idle = fx.manager.allocate_connection(&cred).await.unwrap();
    let busy_listener = Arc::clone(busy.listener());
    idle.close();

    failing.connection_error();

    assert_eq!(fx.factory.destroyed(), 2);
    assert_eq!(busy_listener.state(), ListenerState::InUse);
    assert_eq!(fx.manager.pool().available_permits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_error_inside_transaction_forces_rollback() {
    let fx = fixture(config(2));
    let tx = fx.tm.begin().unwrap();

    let handle = fx
        .manager
        .allocate_connection(&Credential::principal("app"))
        .await
        .unwrap();
    handle.connection_error();

    assert_eq!(tx.status(), TransactionStatus::MarkedRollback);
    assert!(matches!(fx.tm.commit(), Err(TransactionError::RolledBack(_))));
    assert_eq!(fx.manager.pool().available_permits(), 2);
}
