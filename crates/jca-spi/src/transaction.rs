//! Transaction manager contracts.
//!
//! The pool never owns a transaction. It asks the [`TransactionManager`] for
//! the transaction bound to the caller, enlists XA resources with it and
//! registers [`Synchronization`] callbacks that the manager invokes around
//! completion, possibly from another thread.

use std::fmt;
use std::sync::Arc;

use crate::error::TransactionError;
use crate::xa::{XaFlag, XaResource};

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Work is in progress.
    Active,
    /// Work is in progress but the outcome must be rollback.
    MarkedRollback,
    /// Prepare phase in progress.
    Preparing,
    /// All resources prepared.
    Prepared,
    /// Commit phase in progress.
    Committing,
    /// Committed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// Rolled back.
    RolledBack,
    /// Status cannot be determined.
    Unknown,
    /// No transaction is associated.
    NoTransaction,
}

impl TransactionStatus {
    /// Whether work may still be done in the transaction normally.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the transaction has not entered completion yet.
    #[must_use]
    pub fn is_uncommitted(self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }

    /// Whether the transaction has reached a final outcome.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::NoTransaction)
    }
}

/// Outcome delivered to [`Synchronization::after_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
    /// The outcome is unknown (heuristic or communication failure).
    Unknown,
}

/// Opaque key identifying a transaction, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey(pub u64);

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Callback registered with a transaction.
///
/// Implementations must not panic and must not propagate failures; the
/// transaction manager has nobody to report them to.
pub trait Synchronization: Send + Sync {
    /// Called before the two-phase commit starts.
    fn before_completion(&self);

    /// Called once the outcome is known.
    fn after_completion(&self, status: CompletionStatus);
}

/// A transaction as seen by a resource.
pub trait Transaction: Send + Sync {
    /// The key of this transaction.
    fn key(&self) -> TransactionKey;

    /// The current status.
    fn status(&self) -> TransactionStatus;

    /// Enlist a resource. Returns `false` if the manager declined.
    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<bool, TransactionError>;

    /// Delist a previously enlisted resource.
    ///
    /// `flag` is [`XaFlag::Success`], [`XaFlag::Fail`] or [`XaFlag::Suspend`].
    fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flag: XaFlag,
    ) -> Result<bool, TransactionError>;

    /// Register a completion callback.
    fn register_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError>;

    /// Force the outcome to rollback.
    fn set_rollback_only(&self) -> Result<(), TransactionError>;
}

/// Source of the transaction associated with the caller.
pub trait TransactionManager: Send + Sync {
    /// The transaction bound to the calling context, if any.
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>>;
}
