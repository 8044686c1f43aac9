//! # jca-testing
//!
//! Test infrastructure for the managed connection pool.
//!
//! ## Features
//!
//! - [`MockConnectionFactory`] with switchable failures, delays and validity
//! - [`MockXaResource`] recording every XA call as an [`XaEvent`]
//! - [`MockTransactionManager`] driving synchronizations and two-phase commit
//! - [`init_tracing`] for readable logs in tests
//! - [`mock_pool`] and [`eventually`] fixtures for integration tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use jca_testing::{MockConnectionFactory, MockTransactionManager};
//!
//! let factory = Arc::new(MockConnectionFactory::new());
//! let tm = Arc::new(MockTransactionManager::new());
//! let pool = Pool::builder()
//!     .factory(factory.clone())
//!     .transaction_manager(tm.clone())
//!     .build()?;
//!
//! tm.begin()?;
//! let handle = manager.allocate_connection(&credential).await?;
//! handle.close();
//! tm.commit()?;
//! assert_eq!(factory.created(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod factory;
pub mod transaction;
pub mod xa;

pub use factory::{MockConnectionFactory, MockManagedConnection};
pub use transaction::{MockTransaction, MockTransactionManager};
pub use xa::{MockXaResource, XaEvent};

use std::sync::Arc;
use std::time::{Duration, Instant};

use jca_pool::{Pool, PoolConfig, PoolError};
use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Build a pool over `factory`, optionally bound to `tm`.
pub fn mock_pool(
    config: PoolConfig,
    factory: &MockConnectionFactory,
    tm: Option<&Arc<MockTransactionManager>>,
) -> Result<Pool, PoolError> {
    let mut builder = Pool::builder()
        .pool_config(config)
        .factory(Arc::new(factory.clone()));
    if let Some(tm) = tm {
        builder = builder.transaction_manager(Arc::clone(tm) as _);
    }
    builder.build()
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns the final result.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
