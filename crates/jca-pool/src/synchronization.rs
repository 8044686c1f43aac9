//! Transaction completion callbacks for enlisted listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use jca_spi::{CompletionStatus, Synchronization, Transaction, XaFlag, XaResource};

use crate::error::PoolError;
use crate::listener::ConnectionListener;

/// Links one listener to the transaction it is enlisted in.
///
/// Registered with the transaction when the listener is enlisted. Before
/// completion it delists the listener's XA resource; after completion it
/// releases the listener. A cancelled synchronization ignores every callback.
pub struct TransactionSynchronization {
    listener: Weak<ConnectionListener>,
    listener_id: u64,
    transaction: Arc<dyn Transaction>,
    resource: Arc<dyn XaResource>,
    cancelled: AtomicBool,
}

impl TransactionSynchronization {
    pub(crate) fn new(
        listener: Weak<ConnectionListener>,
        listener_id: u64,
        transaction: Arc<dyn Transaction>,
        resource: Arc<dyn XaResource>,
    ) -> Self {
        Self {
            listener,
            listener_id,
            transaction,
            resource,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Id of the listener this synchronization belongs to.
    #[must_use]
    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// The transaction.
    #[must_use]
    pub fn transaction(&self) -> &Arc<dyn Transaction> {
        &self.transaction
    }

    /// The enlisted XA resource.
    #[must_use]
    pub fn resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    /// Join the transaction with the listener's XA resource.
    pub(crate) fn enlist(&self) -> Result<(), PoolError> {
        match self.transaction.enlist_resource(Arc::clone(&self.resource)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PoolError::EnlistmentFailed {
                listener: self.listener_id,
                reason: "transaction refused the resource".into(),
            }),
            Err(e) => Err(PoolError::EnlistmentFailed {
                listener: self.listener_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Make every later callback a no-op.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Synchronization for TransactionSynchronization {
    fn before_completion(&self) {
        if self.is_cancelled() {
            return;
        }
        let status = self.transaction.status();
        if !status.is_uncommitted() {
            return;
        }
        let flag = if status.is_active() {
            XaFlag::Success
        } else {
            XaFlag::Fail
        };
        match self.transaction.delist_resource(&self.resource, flag) {
            Ok(true) => {
                tracing::trace!(listener = self.listener_id, flag = ?flag, "delisted before completion");
            }
            Ok(false) => {
                tracing::warn!(listener = self.listener_id, "resource was not delisted before completion");
            }
            Err(e) => {
                tracing::warn!(listener = self.listener_id, error = %e, "delist before completion failed");
            }
        }
    }

    fn after_completion(&self, status: CompletionStatus) {
        if self.is_cancelled() {
            return;
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.transaction_completed(self, status);
        }
    }
}
