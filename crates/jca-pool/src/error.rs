//! Pool error types.

use std::time::Duration;

use jca_spi::{ResourceError, TransactionError};
use thiserror::Error;

use crate::listener::ListenerState;

/// Errors raised by the pool and the connection manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available before the blocking timeout.
    #[error("no managed connection available in pool '{pool}' within {timeout:?}")]
    NoConnectionAvailable {
        /// Pool name.
        pool: String,
        /// Configured blocking timeout.
        timeout: Duration,
    },

    /// The factory failed to create a physical connection.
    #[error("connection creation failed: {0}")]
    ConnectionCreationFailed(#[source] ResourceError),

    /// `enlist()` was called on a listener that is already enlisted or retired.
    #[error("illegal enlist on listener {listener} in state {state:?}")]
    IllegalEnlistState {
        /// Listener id.
        listener: u64,
        /// State at the time of the call.
        state: ListenerState,
    },

    /// `delist()` was called on a listener that is not enlisted.
    #[error("illegal delist on listener {listener}: not enlisted")]
    IllegalDelistState {
        /// Listener id.
        listener: u64,
    },

    /// A connection failed validation.
    #[error("listener {listener} failed validation: {source}")]
    ValidationFailure {
        /// Listener id.
        listener: u64,
        /// Reason reported by the validating factory.
        #[source]
        source: ResourceError,
    },

    /// The physical connection could not be closed.
    #[error("listener {listener} could not be destroyed: {source}")]
    DestroyFailure {
        /// Listener id.
        listener: u64,
        /// Error raised by the managed connection.
        #[source]
        source: ResourceError,
    },

    /// The transaction refused or failed the enlistment.
    #[error("listener {listener} could not be enlisted: {reason}")]
    EnlistmentFailed {
        /// Listener id.
        listener: u64,
        /// Failure description.
        reason: String,
    },

    /// The transaction refused or failed the delistment.
    #[error("listener {listener} could not be delisted: {reason}")]
    DelistmentFailed {
        /// Listener id.
        listener: u64,
        /// Failure description.
        reason: String,
    },

    /// The pool has been shut down.
    #[error("pool '{0}' is shut down")]
    PoolShutdown(String),

    /// The connection manager has been shut down.
    #[error("connection manager is shut down")]
    ManagerShutdown,

    /// The handle was closed or its connection destroyed.
    #[error("connection handle is closed")]
    HandleClosed,

    /// The managed connection is not of the requested type.
    #[error("managed connection is not a {expected}")]
    ConnectionType {
        /// Requested type name.
        expected: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Resource adapter error.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Transaction manager error.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

impl PoolError {
    /// Whether retrying the acquisition may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoConnectionAvailable { .. } | Self::ConnectionCreationFailed(_)
        )
    }
}
