//! Error types raised across the connector boundary.

use thiserror::Error;

/// Errors raised by a resource adapter's managed connections.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The physical connection could not be created.
    #[error("connection creation failed: {0}")]
    CreationFailed(String),

    /// The physical connection is already closed.
    #[error("managed connection closed")]
    Closed,

    /// The physical connection failed validation.
    #[error("managed connection invalid: {0}")]
    Invalid(String),

    /// IO error talking to the resource.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other adapter-specific failure.
    #[error("{0}")]
    Other(String),
}

/// XA error codes returned by an [`XaResource`](crate::XaResource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XaError {
    /// The resource manager rolled back the branch.
    #[error("XA rollback: {0}")]
    Rollback(String),

    /// Routine invoked in an improper context.
    #[error("XA protocol error: {0}")]
    Protocol(String),

    /// The XID is not known to the resource manager.
    #[error("unknown XID")]
    UnknownXid,

    /// Resource manager failure.
    #[error("resource manager error: {0}")]
    ResourceManager(String),
}

/// Errors raised by a transaction manager.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The operation is not allowed in the transaction's current status.
    #[error("illegal transaction state: {0}")]
    IllegalState(String),

    /// The transaction is marked rollback-only.
    #[error("transaction marked rollback-only")]
    RollbackOnly,

    /// The transaction was rolled back instead of committed.
    #[error("transaction rolled back: {0}")]
    RolledBack(String),

    /// Failure inside the transaction manager itself.
    #[error("transaction system error: {0}")]
    System(String),

    /// Failure reported by an enlisted resource.
    #[error("XA error: {0}")]
    Xa(#[from] XaError),
}
