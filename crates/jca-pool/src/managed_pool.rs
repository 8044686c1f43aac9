//! Per-credential sub-pools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use jca_spi::{Credential, ManagedConnection, ResourceError};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, oneshot};

use crate::config::{FlushMode, PoolConfig};
use crate::error::PoolError;
use crate::listener::{ConnectionListener, ListenerState};
use crate::pool::{PoolInner, PoolShared};
use crate::validator::{IdleRemovalPool, ValidatingPool};

/// The listeners of one credential.
///
/// Capacity is shared with the other sub-pools of the same [`Pool`] through
/// one semaphore: every physical connection holds exactly one permit from
/// creation until destruction.
///
/// [`Pool`]: crate::Pool
pub struct ManagedConnectionPool {
    id: u64,
    credential: Credential,
    shared: Arc<PoolShared>,
    pool: Weak<PoolInner>,
    listeners: Mutex<Vec<Arc<ConnectionListener>>>,
    /// Signalled whenever a listener becomes free.
    freed: Notify,
    shutdown: AtomicBool,
    self_ref: Weak<ManagedConnectionPool>,
}

impl ManagedConnectionPool {
    pub(crate) fn new(
        id: u64,
        credential: Credential,
        shared: Arc<PoolShared>,
        pool: Weak<PoolInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            credential,
            shared,
            pool,
            listeners: Mutex::new(Vec::new()),
            freed: Notify::new(),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Sub-pool id, unique within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The credential this sub-pool serves.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Whether the sub-pool has been shut down or retired.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Snapshot of the current listeners.
    #[must_use]
    pub fn listeners(&self) -> Vec<Arc<ConnectionListener>> {
        self.listeners.lock().clone()
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Number of free listeners.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.state() == ListenerState::Free)
            .count()
    }

    /// Number of listeners not free.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.state() != ListenerState::Free && !l.is_destroyed())
            .count()
    }

    /// Whether the sub-pool holds no listeners.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Hand out a listener, creating one when capacity allows.
    ///
    /// Waits up to the blocking timeout for either a free listener or a
    /// capacity permit. `credential` is passed to the factory when a new
    /// physical connection is created.
    pub async fn get_connection_listener(
        &self,
        credential: &Credential,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        self.acquire(credential, Instant::now()).await
    }

    /// Same as [`get_connection_listener`](Self::get_connection_listener) with
    /// the blocking timeout counted from `started`.
    pub(crate) async fn acquire(
        &self,
        credential: &Credential,
        started: Instant,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        let config = &self.shared.config;
        let deadline = started + config.blocking_timeout;
        let mut waited = false;

        loop {
            if self.is_shut_down() {
                return Err(PoolError::PoolShutdown(config.id.clone()));
            }

            // Registered before scanning so a return between the scan and the
            // wait is not missed.
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(listener) = self.claim_free() {
                listener.touch_checked_out();
                self.shared.record_checkout(started.elapsed(), waited);
                tracing::debug!(
                    pool = %config.id,
                    listener = listener.id(),
                    credential = %self.credential,
                    "checked out free connection"
                );
                return Ok(listener);
            }

            let now = Instant::now();
            if now >= deadline {
                self.shared.record_checkout_failure(started.elapsed(), true);
                tracing::debug!(
                    pool = %config.id,
                    credential = %self.credential,
                    timeout_ms = config.blocking_timeout.as_millis() as u64,
                    "no connection available"
                );
                return Err(PoolError::NoConnectionAvailable {
                    pool: config.id.clone(),
                    timeout: config.blocking_timeout,
                });
            }
            let remaining = deadline - now;

            tokio::select! {
                permit = Arc::clone(&self.shared.semaphore).acquire_owned() => {
                    let Ok(permit) = permit else {
                        return Err(PoolError::PoolShutdown(config.id.clone()));
                    };
                    match self.create_listener(credential, permit, deadline).await {
                        Ok(Some(listener)) => {
                            listener.touch_checked_out();
                            self.shared.record_checkout(started.elapsed(), waited);
                            return Ok(listener);
                        }
                        Ok(None) => waited = true,
                        Err(e) => {
                            self.shared.record_checkout_failure(started.elapsed(), false);
                            return Err(e);
                        }
                    }
                }
                () = &mut freed => {
                    waited = true;
                    tokio::task::yield_now().await;
                }
                () = tokio::time::sleep(remaining) => waited = true,
            }
        }
    }

    /// Claim the first free listener, validating it when configured.
    fn claim_free(&self) -> Option<Arc<ConnectionListener>> {
        let config = &self.shared.config;
        for listener in self.listeners() {
            if !listener.compare_and_set(ListenerState::Free, ListenerState::Validation) {
                continue;
            }

            if config.validate_on_match {
                if let Err(e) = self.validate_listener(&listener) {
                    tracing::warn!(pool = %config.id, error = %e, "destroying invalid connection");
                    self.kill_listener(&listener);
                    if config.use_fast_fail {
                        break;
                    }
                    continue;
                }
                listener.touch_validated();
            }

            if listener.compare_and_set(ListenerState::Validation, ListenerState::InUse) {
                return Some(listener);
            }
            self.kill_listener(&listener);
        }
        None
    }

    /// Create a listener on a blocking worker.
    ///
    /// Returns `Ok(None)` when the deadline passes first; the listener is then
    /// handed to the sub-pool as free once creation finishes.
    async fn create_listener(
        &self,
        credential: &Credential,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
    ) -> Result<Option<Arc<ConnectionListener>>, PoolError> {
        let Some(this) = self.self_ref.upgrade() else {
            return Err(PoolError::PoolShutdown(self.shared.config.id.clone()));
        };
        let credential = credential.clone();
        let (tx, mut rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let result = match this.shared.factory.create_managed_connection(&credential) {
                Ok(connection) => {
                    this.register_listener(connection, permit, ListenerState::InUse, credential)
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(pool = %this.shared.config.id, error = %e, "connection creation failed");
                    Err(PoolError::ConnectionCreationFailed(e))
                }
            };
            if let Err(Ok(listener)) = tx.send(result) {
                tracing::debug!(
                    pool = %this.shared.config.id,
                    listener = listener.id(),
                    "acquirer gave up during creation; releasing connection to pool"
                );
                this.return_connection_listener(&listener, false);
            }
        });

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, &mut rx).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(_)) => Err(PoolError::ConnectionCreationFailed(ResourceError::Other(
                "connection creation aborted".into(),
            ))),
            Err(_) => {
                rx.close();
                match rx.try_recv() {
                    Ok(result) => result.map(Some),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    fn register_listener(
        &self,
        mut connection: Box<dyn ManagedConnection>,
        permit: OwnedSemaphorePermit,
        state: ListenerState,
        credential: Credential,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        let mut listeners = self.listeners.lock();
        if self.is_shut_down() {
            drop(listeners);
            if let Err(e) = connection.destroy() {
                tracing::warn!(pool = %self.shared.config.id, error = %e, "closing connection created after shutdown");
            }
            drop(permit);
            return Err(PoolError::PoolShutdown(self.shared.config.id.clone()));
        }

        permit.forget();
        let id = self.shared.next_listener_id();
        let listener = Arc::new(ConnectionListener::new(
            id,
            credential,
            connection,
            self.self_ref.clone(),
            state,
        ));
        listeners.push(Arc::clone(&listener));
        drop(listeners);

        self.shared.record_created();
        tracing::debug!(
            pool = %self.shared.config.id,
            listener = id,
            credential = %self.credential,
            state = ?state,
            "created connection listener"
        );
        Ok(listener)
    }

    /// Return a listener. With `kill` the listener is destroyed instead of
    /// being made free again.
    pub fn return_connection_listener(&self, listener: &Arc<ConnectionListener>, kill: bool) {
        let mut kill = kill;
        match listener.state() {
            ListenerState::Destroyed | ListenerState::Zombie => return,
            ListenerState::Destroy => kill = true,
            _ => {}
        }

        if !kill {
            if !listener.compare_and_set(ListenerState::InUse, ListenerState::ToPool) {
                tracing::debug!(
                    pool = %self.shared.config.id,
                    listener = listener.id(),
                    state = ?listener.state(),
                    "ignoring return of a listener that is not in use"
                );
                return;
            }
            if let Err(e) = listener.cleanup() {
                tracing::warn!(pool = %self.shared.config.id, listener = listener.id(), error = %e, "cleanup failed");
                kill = true;
            }
        }

        if !kill {
            listener.touch_returned();
            if !self.is_shut_down() && self.release_to_free(listener, ListenerState::ToPool) {
                tracing::trace!(pool = %self.shared.config.id, listener = listener.id(), "returned connection");
                return;
            }
        }

        self.kill_listener(listener);
    }

    fn release_to_free(&self, listener: &ConnectionListener, from: ListenerState) -> bool {
        if listener.compare_and_set(from, ListenerState::Free) {
            self.freed.notify_one();
            true
        } else {
            false
        }
    }

    /// Destroy a listener and release its permit. Returns `false` if it was
    /// already being destroyed.
    fn kill_listener(&self, listener: &Arc<ConnectionListener>) -> bool {
        if !listener.claim_destroy() {
            return false;
        }
        if let Some(sync) = listener.take_enlistment() {
            sync.cancel();
        }
        listener.set_state(ListenerState::Destroy);

        let state = match listener.destroy_connection() {
            Ok(()) => ListenerState::Destroyed,
            Err(source) => {
                let err = PoolError::DestroyFailure {
                    listener: listener.id(),
                    source,
                };
                tracing::warn!(pool = %self.shared.config.id, error = %err, "physical close failed");
                ListenerState::Zombie
            }
        };
        listener.set_state(state);

        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
        self.shared.semaphore.add_permits(1);
        self.shared.record_destroyed();
        tracing::debug!(
            pool = %self.shared.config.id,
            listener = listener.id(),
            state = ?state,
            "destroyed connection listener"
        );

        self.schedule_prefill();
        true
    }

    fn validate_listener(&self, listener: &ConnectionListener) -> Result<(), PoolError> {
        let Some(checker) = self.shared.factory.as_validating() else {
            return Ok(());
        };
        let result = listener
            .with_connection(|connection| checker.validate(connection))?
            .map_err(|source| PoolError::ValidationFailure {
                listener: listener.id(),
                source,
            });
        self.shared.record_validation(result.is_ok());
        result
    }

    /// Destroy listeners according to `mode`. Returns how many were destroyed.
    pub fn flush(&self, mode: FlushMode) -> usize {
        let mut destroyed = 0;
        for listener in self.listeners() {
            match mode {
                FlushMode::All => {
                    if self.kill_listener(&listener) {
                        destroyed += 1;
                    }
                }
                FlushMode::Idle => {
                    if listener.compare_and_set(ListenerState::Free, ListenerState::Flush)
                        && self.kill_listener(&listener)
                    {
                        destroyed += 1;
                    }
                }
                FlushMode::Gracefully => {
                    if listener.compare_and_set(ListenerState::Free, ListenerState::Flush) {
                        if self.kill_listener(&listener) {
                            destroyed += 1;
                        }
                    } else {
                        listener.compare_and_set(ListenerState::InUse, ListenerState::Destroy);
                    }
                }
                FlushMode::Invalid => {
                    if !listener.compare_and_set(ListenerState::Free, ListenerState::Validation) {
                        continue;
                    }
                    match self.validate_listener(&listener) {
                        Ok(()) => {
                            listener.touch_validated();
                            if !self.release_to_free(&listener, ListenerState::Validation)
                                && self.kill_listener(&listener)
                            {
                                destroyed += 1;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(pool = %self.shared.config.id, error = %e, "flushing invalid connection");
                            if self.kill_listener(&listener) {
                                destroyed += 1;
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(
            pool = %self.shared.config.id,
            credential = %self.credential,
            mode = ?mode,
            destroyed,
            "flushed sub-pool"
        );
        self.retire_if_empty();
        destroyed
    }

    /// React to a fatal error on `listener` according to the flush strategy.
    pub(crate) fn connection_error_occurred(&self, listener: &Arc<ConnectionListener>) {
        self.kill_listener(listener);

        let strategy = self.shared.config.flush_strategy;
        let Some(mode) = strategy.mode() else {
            return;
        };
        tracing::debug!(pool = %self.shared.config.id, strategy = %strategy, "applying flush strategy");
        if strategy.is_pool_wide() {
            if let Some(pool) = self.pool.upgrade() {
                pool.flush(mode);
            }
        } else {
            self.flush(mode);
        }
    }

    fn keeps_minimum(&self) -> bool {
        self.shared.config.prefill && self.credential.is_prefill()
    }

    /// Top the prefill sub-pool back up to the minimum size.
    pub(crate) fn schedule_prefill(&self) {
        if !self.keeps_minimum() || self.is_shut_down() {
            return;
        }
        let min = self.shared.config.min_size;
        if min == 0 || self.listener_count() >= min as usize {
            return;
        }
        self.spawn_fill(min);
    }

    /// Fill to `size` on a blocking worker, or inline outside a runtime.
    pub(crate) fn spawn_fill(&self, size: u32) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || this.fill_to(size));
            }
            Err(_) => this.fill_to(size),
        }
    }

    /// Create free listeners until the sub-pool holds `size` of them or no
    /// capacity is left. Never waits for capacity.
    pub fn fill_to(&self, size: u32) {
        let size = size.min(self.shared.config.max_size) as usize;
        loop {
            if self.is_shut_down() || self.listener_count() >= size {
                return;
            }
            let Ok(permit) = Arc::clone(&self.shared.semaphore).try_acquire_owned() else {
                tracing::debug!(pool = %self.shared.config.id, "no capacity left to prefill");
                return;
            };
            match self
                .shared
                .factory
                .create_managed_connection(&self.credential)
            {
                Ok(connection) => {
                    let registered = self.register_listener(
                        connection,
                        permit,
                        ListenerState::Free,
                        self.credential.clone(),
                    );
                    if registered.is_err() {
                        return;
                    }
                    self.freed.notify_one();
                }
                Err(e) => {
                    tracing::warn!(pool = %self.shared.config.id, error = %e, "prefill failed");
                    return;
                }
            }
        }
    }

    fn retire_if_empty(&self) {
        if self.keeps_minimum() || !self.is_empty() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_sub_pool(self);
        }
    }

    /// Mark the sub-pool retired if it is still empty.
    pub(crate) fn try_retire(&self) -> bool {
        let listeners = self.listeners.lock();
        if !listeners.is_empty() || self.is_shut_down() {
            return false;
        }
        self.shutdown.store(true, Ordering::Release);
        true
    }

    /// Stop background scanning and wake every waiter.
    pub(crate) fn release_background(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            if let Some(validator) = &self.shared.validator {
                let as_validating: Arc<dyn ValidatingPool> = this.clone();
                validator.unregister_pool(&as_validating);
            }
            if let Some(remover) = &self.shared.idle_remover {
                let as_idle: Arc<dyn IdleRemovalPool> = this;
                remover.unregister_pool(&as_idle);
            }
        }
        self.freed.notify_waiters();
    }

    /// Destroy every listener, including those in use.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release_background();

        let listeners = self.listeners();
        for listener in &listeners {
            self.kill_listener(listener);
        }
        tracing::debug!(
            pool = %self.shared.config.id,
            credential = %self.credential,
            destroyed = listeners.len(),
            "sub-pool shut down"
        );
    }
}

impl ValidatingPool for ManagedConnectionPool {
    fn validate_connections(&self) {
        if self.is_shut_down() || self.shared.factory.as_validating().is_none() {
            return;
        }
        let interval = self.shared.config.background_validation_interval;

        for listener in self.listeners() {
            if !listener.compare_and_set(ListenerState::Free, ListenerState::Validation) {
                continue;
            }

            if listener.last_validated().elapsed() < interval {
                if !self.release_to_free(&listener, ListenerState::Validation) {
                    self.kill_listener(&listener);
                }
                continue;
            }

            match self.validate_listener(&listener) {
                Ok(()) => {
                    listener.touch_validated();
                    if !self.release_to_free(&listener, ListenerState::Validation) {
                        self.kill_listener(&listener);
                    }
                }
                Err(e) => {
                    tracing::warn!(pool = %self.shared.config.id, error = %e, "background validation failed");
                    self.kill_listener(&listener);
                }
            }
        }
    }
}

impl IdleRemovalPool for ManagedConnectionPool {
    fn remove_idle_connections(&self) {
        let Some(timeout) = self.shared.config.idle_timeout else {
            return;
        };
        if self.is_shut_down() {
            return;
        }
        let keep = if self.keeps_minimum() {
            self.shared.config.min_size as usize
        } else {
            0
        };

        let mut removed = 0u64;
        for listener in self.listeners() {
            if self.listener_count() <= keep {
                break;
            }
            if listener.state() != ListenerState::Free || listener.idle_time() < timeout {
                continue;
            }
            if listener.compare_and_set(ListenerState::Free, ListenerState::Flush)
                && self.kill_listener(&listener)
            {
                removed += 1;
            }
        }

        if removed > 0 {
            self.shared.record_idle_timeouts(removed);
            tracing::debug!(
                pool = %self.shared.config.id,
                credential = %self.credential,
                removed,
                "removed idle connections"
            );
        }
        self.retire_if_empty();
    }
}

impl std::fmt::Debug for ManagedConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnectionPool")
            .field("id", &self.id)
            .field("credential", &self.credential)
            .field("listeners", &self.listener_count())
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}
