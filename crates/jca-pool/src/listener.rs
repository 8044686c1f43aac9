//! Connection listeners.
//!
//! A [`ConnectionListener`] wraps exactly one physical managed connection. It
//! owns the connection's lifecycle state, its transaction association and the
//! set of application handles currently open on it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use jca_spi::{
    CompletionStatus, Credential, ManagedConnection, ResourceError, Transaction, TransactionKey,
    XaFlag,
};
use parking_lot::Mutex;

use crate::error::PoolError;
use crate::managed_pool::ManagedConnectionPool;
use crate::synchronization::TransactionSynchronization;

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ListenerState {
    /// Available for checkout.
    Free = 0,
    /// Checked out by an application.
    InUse = 1,
    /// Claimed for validation.
    Validation = 2,
    /// Being cleaned up on its way back to the pool.
    ToPool = 3,
    /// Marked for destruction; destroyed when returned.
    Destroy = 4,
    /// Physical connection closed. Terminal.
    Destroyed = 5,
    /// Claimed by a flush or idle removal.
    Flush = 6,
    /// Physical close failed. Terminal.
    Zombie = 7,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::InUse,
            2 => Self::Validation,
            3 => Self::ToPool,
            4 => Self::Destroy,
            5 => Self::Destroyed,
            6 => Self::Flush,
            _ => Self::Zombie,
        }
    }

    /// Whether no transition can leave this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Zombie)
    }
}

#[derive(Debug, Clone, Copy)]
struct Timestamps {
    last_validated: Instant,
    last_checked_out: Instant,
    last_returned: Instant,
}

/// The pool's wrapper around one physical connection.
pub struct ConnectionListener {
    id: u64,
    credential: Credential,
    state: AtomicU8,
    /// Set once by whoever destroys the physical connection.
    destroying: AtomicBool,
    connection: Mutex<Box<dyn ManagedConnection>>,
    pool: Weak<ManagedConnectionPool>,
    enlistment: Mutex<Option<Arc<TransactionSynchronization>>>,
    handles: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
    times: Mutex<Timestamps>,
    created_at: Instant,
}

impl ConnectionListener {
    pub(crate) fn new(
        id: u64,
        credential: Credential,
        connection: Box<dyn ManagedConnection>,
        pool: Weak<ManagedConnectionPool>,
        state: ListenerState,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            credential,
            state: AtomicU8::new(state as u8),
            destroying: AtomicBool::new(false),
            connection: Mutex::new(connection),
            pool,
            enlistment: Mutex::new(None),
            handles: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(1),
            times: Mutex::new(Timestamps {
                last_validated: now,
                last_checked_out: now,
                last_returned: now,
            }),
            created_at: now,
        }
    }

    /// Listener id, unique within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credential the physical connection was created for.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `expected` to `new`. Returns `false` if the
    /// state was not `expected`. Terminal states are never left.
    pub fn compare_and_set(&self, expected: ListenerState, new: ListenerState) -> bool {
        if expected.is_terminal() {
            return false;
        }
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the physical connection has been closed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the listener is enlisted in a transaction.
    #[must_use]
    pub fn is_enlisted(&self) -> bool {
        self.enlistment.lock().is_some()
    }

    /// Key of the transaction the listener is enlisted in.
    #[must_use]
    pub fn transaction_key(&self) -> Option<TransactionKey> {
        self.enlistment.lock().as_ref().map(|s| s.transaction().key())
    }

    /// Number of open application handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// When the listener was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last validated (creation counts).
    #[must_use]
    pub fn last_validated(&self) -> Instant {
        self.times.lock().last_validated
    }

    /// When the listener was last handed out.
    #[must_use]
    pub fn last_checked_out(&self) -> Instant {
        self.times.lock().last_checked_out
    }

    /// How long the listener has been sitting in the pool since its last return.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.times.lock().last_returned.elapsed()
    }

    pub(crate) fn touch_validated(&self) {
        self.times.lock().last_validated = Instant::now();
    }

    pub(crate) fn touch_checked_out(&self) {
        self.times.lock().last_checked_out = Instant::now();
    }

    pub(crate) fn touch_returned(&self) {
        self.times.lock().last_returned = Instant::now();
    }

    /// Run `f` against the physical connection.
    ///
    /// Fails with [`PoolError::HandleClosed`] once the connection is destroyed.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn ManagedConnection) -> R,
    ) -> Result<R, PoolError> {
        if self.is_destroyed() {
            return Err(PoolError::HandleClosed);
        }
        let mut connection = self.connection.lock();
        Ok(f(connection.as_mut()))
    }

    pub(crate) fn cleanup(&self) -> Result<(), ResourceError> {
        self.connection.lock().cleanup()
    }

    /// Claim the right to destroy the physical connection. Only the first
    /// caller gets `true`.
    pub(crate) fn claim_destroy(&self) -> bool {
        !self.destroying.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn destroy_connection(&self) -> Result<(), ResourceError> {
        self.connection.lock().destroy()
    }

    pub(crate) fn take_enlistment(&self) -> Option<Arc<TransactionSynchronization>> {
        self.enlistment.lock().take()
    }

    pub(crate) fn open_handle(&self) -> Result<u64, PoolError> {
        self.with_connection(|connection| connection.open_handle(&self.credential))??;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(handle);
        Ok(handle)
    }

    /// Enlist the connection in `transaction`.
    ///
    /// Enlisting a listener that is already enlisted, or that is being
    /// retired, fails with [`PoolError::IllegalEnlistState`]; the listener is
    /// destroyed and its stale transaction is marked rollback-only.
    pub fn enlist(self: &Arc<Self>, transaction: Arc<dyn Transaction>) -> Result<(), PoolError> {
        let state = self.state();
        let mut enlistment = self.enlistment.lock();

        if enlistment.is_some() || matches!(state, ListenerState::Destroy) || state.is_terminal() {
            let stale = enlistment.take();
            drop(enlistment);
            tracing::warn!(
                listener = self.id,
                state = ?state,
                tx = %transaction.key(),
                "enlist called on a listener that is already enlisted or retired"
            );
            halt_catch_fire(stale);
            self.return_to_pool(true);
            return Err(PoolError::IllegalEnlistState {
                listener: self.id,
                state,
            });
        }

        let resource = {
            let connection = self.connection.lock();
            connection.xa_resource()
        }
        .map_err(|e| PoolError::EnlistmentFailed {
            listener: self.id,
            reason: e.to_string(),
        })?;

        let sync = Arc::new(TransactionSynchronization::new(
            Arc::downgrade(self),
            self.id,
            Arc::clone(&transaction),
            resource,
        ));
        *enlistment = Some(Arc::clone(&sync));

        if let Err(e) = sync.enlist() {
            *enlistment = None;
            return Err(e);
        }
        if let Err(e) = transaction.register_synchronization(sync.clone()) {
            *enlistment = None;
            drop(enlistment);
            sync.cancel();
            if let Err(delist) = transaction.delist_resource(sync.resource(), XaFlag::Fail) {
                tracing::warn!(listener = self.id, error = %delist, "delist after failed registration");
            }
            return Err(PoolError::EnlistmentFailed {
                listener: self.id,
                reason: e.to_string(),
            });
        }

        tracing::trace!(listener = self.id, tx = %transaction.key(), "enlisted");
        Ok(())
    }

    /// Detach the connection from its transaction.
    ///
    /// Delisting a listener that is not enlisted fails with
    /// [`PoolError::IllegalDelistState`] and destroys the listener. A
    /// delist the transaction rejects also destroys it, since the
    /// connection's transactional state is then unknown.
    pub fn delist(self: &Arc<Self>) -> Result<(), PoolError> {
        let Some(sync) = self.take_enlistment() else {
            tracing::warn!(listener = self.id, "delist called on a listener that is not enlisted");
            self.return_to_pool(true);
            return Err(PoolError::IllegalDelistState { listener: self.id });
        };

        sync.cancel();
        let transaction = sync.transaction();
        if transaction.status().is_uncommitted() {
            let reason = match transaction.delist_resource(sync.resource(), XaFlag::Success) {
                Ok(true) => None,
                Ok(false) => Some("transaction refused the delist".to_owned()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                tracing::warn!(
                    listener = self.id,
                    tx = %transaction.key(),
                    reason = %reason,
                    "delist failed, destroying connection"
                );
                self.return_to_pool(true);
                return Err(PoolError::DelistmentFailed {
                    listener: self.id,
                    reason,
                });
            }
        }

        tracing::trace!(listener = self.id, tx = %transaction.key(), "delisted");
        Ok(())
    }

    /// An application handle was closed.
    ///
    /// Whether the listener goes back to the pool is decided while the
    /// enlistment lock is held, so this and [`Self::transaction_completed`]
    /// never both release the same checkout.
    pub fn connection_closed(self: &Arc<Self>, handle: u64) {
        let release = {
            let enlistment = self.enlistment.lock();
            let mut handles = self.handles.lock();
            if !handles.remove(&handle) {
                return;
            }
            handles.is_empty()
                && enlistment.is_none()
                && matches!(self.state(), ListenerState::InUse | ListenerState::Destroy)
        };

        if !self.is_destroyed() {
            self.connection.lock().close_handle();
        }

        if release {
            self.return_to_pool(false);
        }
    }

    /// An application handle reported a fatal connection error.
    pub fn connection_error_occurred(self: &Arc<Self>, handle: u64) {
        self.handles.lock().clear();
        tracing::warn!(listener = self.id, handle, "connection error reported");
        halt_catch_fire(self.take_enlistment());

        match self.pool.upgrade() {
            Some(pool) => pool.connection_error_occurred(self),
            None => self.destroy_orphan(),
        }
    }

    pub(crate) fn transaction_completed(
        self: &Arc<Self>,
        sync: &TransactionSynchronization,
        status: CompletionStatus,
    ) {
        let tracking = self
            .pool
            .upgrade()
            .is_none_or(|pool| pool.config().tracking);

        // Lock order: enlistment, then handles.
        let leaked: Vec<u64> = {
            let mut enlistment = self.enlistment.lock();
            match enlistment.as_ref() {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), sync) => *enlistment = None,
                _ => return,
            }
            let mut handles = self.handles.lock();
            if !handles.is_empty() && !tracking {
                tracing::trace!(
                    listener = self.id,
                    status = ?status,
                    open = handles.len(),
                    "transaction completed with handles open"
                );
                return;
            }
            handles.drain().collect()
        };

        tracing::trace!(listener = self.id, status = ?status, "transaction completed");

        if leaked.is_empty() {
            self.return_to_pool(false);
        } else {
            tracing::warn!(
                listener = self.id,
                handles = ?leaked,
                "closing connection handles left open at transaction completion"
            );
            self.return_to_pool(true);
        }
    }

    /// Hand the listener back to its sub-pool.
    pub(crate) fn return_to_pool(self: &Arc<Self>, kill: bool) {
        match self.pool.upgrade() {
            Some(pool) => pool.return_connection_listener(self, kill),
            None => self.destroy_orphan(),
        }
    }

    fn destroy_orphan(&self) {
        if !self.claim_destroy() {
            return;
        }
        let state = match self.destroy_connection() {
            Ok(()) => ListenerState::Destroyed,
            Err(e) => {
                tracing::warn!(listener = self.id, error = %e, "closing orphaned connection failed");
                ListenerState::Zombie
            }
        };
        self.set_state(state);
    }
}

/// Abort the enlistment represented by `stale`: cancel its callbacks, delist
/// with failure and force a rollback.
fn halt_catch_fire(stale: Option<Arc<TransactionSynchronization>>) {
    let Some(sync) = stale else {
        return;
    };
    sync.cancel();
    let transaction = sync.transaction();
    if !transaction.status().is_uncommitted() {
        return;
    }
    if let Err(e) = transaction.delist_resource(sync.resource(), XaFlag::Fail) {
        tracing::warn!(listener = sync.listener_id(), error = %e, "delist with failure");
    }
    if let Err(e) = transaction.set_rollback_only() {
        tracing::warn!(listener = sync.listener_id(), error = %e, "set rollback-only");
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("id", &self.id)
            .field("credential", &self.credential)
            .field("state", &self.state())
            .field("enlisted", &self.is_enlisted())
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}
