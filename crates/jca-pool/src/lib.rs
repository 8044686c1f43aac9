//! # jca-pool
//!
//! Managed connection pool with credential partitioning and transaction
//! enlistment.
//!
//! Physical connections are created by a [`ManagedConnectionFactory`], wrapped
//! in [`ConnectionListener`]s and kept in one sub-pool per [`Credential`]. A
//! single semaphore bounds the physical connections of a [`Pool`] across all
//! of its sub-pools.
//!
//! ## Features
//!
//! - Blocking acquisition with a mandatory timeout
//! - Lifecycle state machine with destroy-on-error semantics
//! - XA enlistment through transaction synchronizations
//! - Background validation with dynamic interval adjustment
//! - Idle connection removal, prefill and flush strategies
//! - Comprehensive metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use jca_pool::{ConnectionManager, Pool, PoolConfig};
//! use std::time::Duration;
//!
//! let pool = Pool::builder()
//!     .pool_config(PoolConfig::from_properties("max-pool-size=20;blocking-timeout-millis=500")?)
//!     .factory(factory)
//!     .transaction_manager(tm)
//!     .build()?;
//!
//! let manager = ConnectionManager::new(pool);
//! let handle = manager.allocate_connection(&credential).await?;
//! // Use connection...
//! handle.close();
//!
//! // Check pool status
//! let status = manager.pool().status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```
//!
//! [`ManagedConnectionFactory`]: jca_spi::ManagedConnectionFactory
//! [`Credential`]: jca_spi::Credential

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection_manager;
pub mod error;
pub mod listener;
pub mod managed_pool;
pub mod pool;
pub mod synchronization;
pub mod validator;

// Configuration
pub use config::{FlushMode, FlushStrategy, PoolConfig, TransactionSupportLevel};

// Error types
pub use error::PoolError;

// Pool types
pub use managed_pool::ManagedConnectionPool;
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus};

// Listeners and transactions
pub use listener::{ConnectionListener, ListenerState};
pub use synchronization::TransactionSynchronization;

// Background scanning
pub use validator::{ConnectionValidator, IdleConnectionRemover, IdleRemovalPool, ValidatingPool};

// Application entry point
pub use connection_manager::{ConnectionHandle, ConnectionManager};
