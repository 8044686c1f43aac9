//! In-memory transaction manager.
//!
//! One transaction at a time is bound to the manager, standing in for the
//! thread association of a real manager. Commit runs the synchronizations,
//! ends every active branch and drives two-phase commit over the enlisted
//! resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use jca_spi::{
    CompletionStatus, Synchronization, Transaction, TransactionError, TransactionKey,
    TransactionManager, TransactionStatus, XaFlag, XaResource, XaVote, Xid,
};
use parking_lot::Mutex;

const FORMAT_ID: i32 = 0x4a43_4154;

/// A [`TransactionManager`] with a single current-transaction slot.
#[derive(Default)]
pub struct MockTransactionManager {
    current: Mutex<Option<Arc<MockTransaction>>>,
    next_key: AtomicU64,
}

impl MockTransactionManager {
    /// Create a manager with no current transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transaction and make it current.
    pub fn begin(&self) -> Result<Arc<MockTransaction>, TransactionError> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(TransactionError::IllegalState(
                "transaction already active".into(),
            ));
        }
        let key = TransactionKey(self.next_key.fetch_add(1, Ordering::SeqCst) + 1);
        let tx = Arc::new(MockTransaction::new(key));
        *current = Some(Arc::clone(&tx));
        Ok(tx)
    }

    /// The current transaction.
    #[must_use]
    pub fn current(&self) -> Option<Arc<MockTransaction>> {
        self.current.lock().clone()
    }

    /// Unbind the current transaction without completing it.
    pub fn suspend(&self) -> Option<Arc<MockTransaction>> {
        self.current.lock().take()
    }

    /// Bind `tx` as the current transaction.
    pub fn resume(&self, tx: Arc<MockTransaction>) {
        *self.current.lock() = Some(tx);
    }

    /// Commit and unbind the current transaction.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let tx = self.take_current()?;
        tx.commit()
    }

    /// Roll back and unbind the current transaction.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        let tx = self.take_current()?;
        tx.rollback()
    }

    fn take_current(&self) -> Result<Arc<MockTransaction>, TransactionError> {
        self.current
            .lock()
            .take()
            .ok_or_else(|| TransactionError::IllegalState("no current transaction".into()))
    }
}

impl TransactionManager for MockTransactionManager {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.current().map(|tx| tx as Arc<dyn Transaction>)
    }
}

struct Branch {
    resource: Arc<dyn XaResource>,
    xid: Xid,
    active: bool,
}

/// A transaction created by [`MockTransactionManager`].
pub struct MockTransaction {
    key: TransactionKey,
    status: Mutex<TransactionStatus>,
    branches: Mutex<Vec<Branch>>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl MockTransaction {
    fn new(key: TransactionKey) -> Self {
        Self {
            key,
            status: Mutex::new(TransactionStatus::Active),
            branches: Mutex::new(Vec::new()),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    /// Resources enlisted so far, ended ones included.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.branches.lock().len()
    }

    /// Synchronizations registered so far.
    #[must_use]
    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    fn require_uncommitted(&self) -> Result<TransactionStatus, TransactionError> {
        let status = *self.status.lock();
        if status.is_uncommitted() {
            Ok(status)
        } else {
            Err(TransactionError::IllegalState(format!(
                "{} is {status:?}",
                self.key
            )))
        }
    }

    /// Commit with two-phase commit over every branch.
    pub fn commit(&self) -> Result<(), TransactionError> {
        self.require_uncommitted()?;

        let syncs = self.synchronizations.lock().clone();
        for sync in &syncs {
            sync.before_completion();
        }
        self.end_active(XaFlag::Success);

        if *self.status.lock() == TransactionStatus::MarkedRollback {
            self.roll_back_branches(&syncs);
            return Err(TransactionError::RolledBack("marked rollback-only".into()));
        }

        self.set_status(TransactionStatus::Preparing);
        let votes: Result<Vec<XaVote>, _> = self
            .branches
            .lock()
            .iter()
            .map(|branch| branch.resource.prepare(&branch.xid))
            .collect();
        let votes = match votes {
            Ok(votes) => votes,
            Err(e) => {
                self.roll_back_branches(&syncs);
                return Err(TransactionError::RolledBack(e.to_string()));
            }
        };

        self.set_status(TransactionStatus::Committing);
        for (branch, vote) in self.branches.lock().iter().zip(votes) {
            if vote == XaVote::ReadOnly {
                continue;
            }
            if let Err(e) = branch.resource.commit(&branch.xid, false) {
                tracing::warn!(tx = %self.key, xid = ?branch.xid, error = %e, "branch commit failed");
            }
        }
        self.set_status(TransactionStatus::Committed);

        for sync in &syncs {
            sync.after_completion(CompletionStatus::Committed);
        }
        Ok(())
    }

    /// Roll back every branch.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        self.require_uncommitted()?;
        let syncs = self.synchronizations.lock().clone();
        self.end_active(XaFlag::Fail);
        self.roll_back_branches(&syncs);
        Ok(())
    }

    fn end_active(&self, flag: XaFlag) {
        let mut branches = self.branches.lock();
        for branch in branches.iter_mut().filter(|b| b.active) {
            if let Err(e) = branch.resource.end(&branch.xid, flag) {
                tracing::warn!(tx = %self.key, xid = ?branch.xid, error = %e, "branch end failed");
            }
            branch.active = false;
        }
    }

    fn roll_back_branches(&self, syncs: &[Arc<dyn Synchronization>]) {
        self.set_status(TransactionStatus::RollingBack);
        for branch in self.branches.lock().iter() {
            if let Err(e) = branch.resource.rollback(&branch.xid) {
                tracing::warn!(tx = %self.key, xid = ?branch.xid, error = %e, "branch rollback failed");
            }
        }
        self.set_status(TransactionStatus::RolledBack);
        for sync in syncs {
            sync.after_completion(CompletionStatus::RolledBack);
        }
    }
}

impl Transaction for MockTransaction {
    fn key(&self) -> TransactionKey {
        self.key
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<bool, TransactionError> {
        if self.require_uncommitted()? == TransactionStatus::MarkedRollback {
            return Err(TransactionError::RollbackOnly);
        }

        let mut branches = self.branches.lock();
        if let Some(branch) = branches
            .iter_mut()
            .find(|b| Arc::ptr_eq(&b.resource, &resource))
        {
            if branch.active {
                return Ok(true);
            }
            branch.resource.start(&branch.xid, XaFlag::Join)?;
            branch.active = true;
            return Ok(true);
        }

        let qualifier = (branches.len() as u64 + 1).to_be_bytes();
        let xid = Xid::new(FORMAT_ID, &self.key.0.to_be_bytes(), &qualifier);
        resource.start(&xid, XaFlag::NoFlags)?;
        branches.push(Branch {
            resource,
            xid,
            active: true,
        });
        Ok(true)
    }

    fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flag: XaFlag,
    ) -> Result<bool, TransactionError> {
        let mut branches = self.branches.lock();
        let Some(branch) = branches
            .iter_mut()
            .find(|b| b.active && Arc::ptr_eq(&b.resource, resource))
        else {
            return Ok(false);
        };
        branch.resource.end(&branch.xid, flag)?;
        branch.active = false;
        drop(branches);

        if flag == XaFlag::Fail {
            self.set_status(TransactionStatus::MarkedRollback);
        }
        Ok(true)
    }

    fn register_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError> {
        if self.require_uncommitted()? == TransactionStatus::MarkedRollback {
            return Err(TransactionError::RollbackOnly);
        }
        self.synchronizations.lock().push(sync);
        Ok(())
    }

    fn set_rollback_only(&self) -> Result<(), TransactionError> {
        self.require_uncommitted()?;
        self.set_status(TransactionStatus::MarkedRollback);
        Ok(())
    }
}

impl std::fmt::Debug for MockTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransaction")
            .field("key", &self.key)
            .field("status", &*self.status.lock())
            .field("branches", &self.branches.lock().len())
            .finish_non_exhaustive()
    }
}
