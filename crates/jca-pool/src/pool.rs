//! Connection pool implementation.
//!
//! A [`Pool`] owns one sub-pool per credential and a single semaphore that
//! bounds the number of physical connections across all of them. It also
//! tracks which listener each transaction already uses, so repeated requests
//! inside one transaction share a connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use jca_spi::{
    CompletionStatus, Credential, ManagedConnectionFactory, Synchronization, Transaction,
    TransactionKey, TransactionManager,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::config::{FlushMode, PoolConfig, TransactionSupportLevel};
use crate::error::PoolError;
use crate::listener::{ConnectionListener, ListenerState};
use crate::managed_pool::ManagedConnectionPool;
use crate::validator::{ConnectionValidator, IdleConnectionRemover, IdleRemovalPool, ValidatingPool};

/// A managed connection pool.
///
/// Cloning a `Pool` is cheap; clones share the same connections. The pool is
/// shut down when the last clone is dropped or [`shutdown`](Pool::shutdown)
/// is called.
///
/// # Example
///
/// ```rust,ignore
/// use jca_pool::{Pool, PoolConfig};
/// use std::time::Duration;
///
/// let pool = Pool::builder()
///     .pool_config(PoolConfig::new().max_size(10))
///     .factory(factory)
///     .blocking_timeout(Duration::from_millis(500))
///     .build()?;
///
/// let listener = pool.get_connection_listener(&credential).await?;
/// // Use the connection...
/// pool.return_connection_listener(&listener, false);
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// State shared by the pool and its sub-pools.
pub(crate) struct PoolShared {
    /// Pool configuration.
    pub(crate) config: PoolConfig,

    /// Physical connection factory.
    pub(crate) factory: Arc<dyn ManagedConnectionFactory>,

    /// One permit per physical connection.
    pub(crate) semaphore: Arc<Semaphore>,

    pub(crate) validator: Option<Arc<ConnectionValidator>>,

    pub(crate) idle_remover: Option<Arc<IdleConnectionRemover>>,

    /// Counter for generating listener IDs.
    next_listener_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

impl PoolShared {
    pub(crate) fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    fn live_connections(&self) -> u32 {
        let available = self.semaphore.available_permits() as u32;
        self.config.max_size.saturating_sub(available)
    }

    pub(crate) fn record_created(&self) {
        let live = self.live_connections();
        let mut metrics = self.metrics.lock();
        metrics.connections_created += 1;
        metrics.max_used = metrics.max_used.max(live);
    }

    pub(crate) fn record_destroyed(&self) {
        self.metrics.lock().connections_destroyed += 1;
    }

    pub(crate) fn record_checkout(&self, elapsed: Duration, waited: bool) {
        let mut metrics = self.metrics.lock();
        metrics.checkouts_successful += 1;
        metrics.total_blocking_time += elapsed;
        metrics.max_blocking_time = metrics.max_blocking_time.max(elapsed);
        if waited {
            metrics.waits += 1;
        }
    }

    pub(crate) fn record_checkout_failure(&self, elapsed: Duration, timed_out: bool) {
        let mut metrics = self.metrics.lock();
        metrics.checkouts_failed += 1;
        metrics.total_blocking_time += elapsed;
        metrics.max_blocking_time = metrics.max_blocking_time.max(elapsed);
        if timed_out {
            metrics.blocking_failures += 1;
        }
    }

    pub(crate) fn record_validation(&self, ok: bool) {
        let mut metrics = self.metrics.lock();
        metrics.validations_performed += 1;
        if !ok {
            metrics.validations_failed += 1;
        }
    }

    pub(crate) fn record_idle_timeouts(&self, count: u64) {
        self.metrics.lock().idle_timeouts += count;
    }
}

pub(crate) struct PoolInner {
    shared: Arc<PoolShared>,

    transaction_manager: Option<Arc<dyn TransactionManager>>,

    sub_pools: Mutex<HashMap<Credential, Arc<ManagedConnectionPool>>>,

    /// Transaction key -> sub-pool id -> listener used by that transaction.
    transactions: Mutex<HashMap<TransactionKey, HashMap<u64, Arc<ConnectionListener>>>>,

    /// Whether the pool is closed.
    closed: AtomicBool,

    next_sub_pool_id: AtomicU64,

    self_ref: Weak<PoolInner>,
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn sub_pool_key(&self, credential: &Credential) -> Credential {
        if self.shared.config.pool_by_credential {
            credential.clone()
        } else {
            Credential::default()
        }
    }

    fn sub_pool(&self, credential: &Credential) -> Option<Arc<ManagedConnectionPool>> {
        let key = self.sub_pool_key(credential);
        self.sub_pools.lock().get(&key).cloned()
    }

    /// Find or create the sub-pool serving `credential`.
    fn sub_pool_for(&self, credential: &Credential) -> Result<Arc<ManagedConnectionPool>, PoolError> {
        let key = self.sub_pool_key(credential);
        let created = {
            let mut sub_pools = self.sub_pools.lock();
            if self.is_closed() {
                return Err(PoolError::PoolShutdown(self.shared.config.id.clone()));
            }
            if let Some(existing) = sub_pools.get(&key) {
                return Ok(Arc::clone(existing));
            }
            let id = self.next_sub_pool_id.fetch_add(1, Ordering::Relaxed);
            let sub_pool = ManagedConnectionPool::new(
                id,
                key.clone(),
                Arc::clone(&self.shared),
                self.self_ref.clone(),
            );
            sub_pools.insert(key, Arc::clone(&sub_pool));
            sub_pool
        };

        tracing::debug!(
            pool = %self.shared.config.id,
            sub_pool = created.id(),
            credential = %created.credential(),
            "created sub-pool"
        );
        self.register_background(&created);

        let config = &self.shared.config;
        if config.prefill && created.credential().is_prefill() {
            created.spawn_fill(config.effective_initial_size());
        }
        Ok(created)
    }

    fn register_background(&self, sub_pool: &Arc<ManagedConnectionPool>) {
        let config = &self.shared.config;
        if config.background_validation && self.shared.factory.as_validating().is_some() {
            if let Some(validator) = &self.shared.validator {
                let pool: Arc<dyn ValidatingPool> = sub_pool.clone();
                validator.register_pool(pool, config.background_validation_interval);
            }
        }
        if let (Some(timeout), Some(remover)) = (config.idle_timeout, &self.shared.idle_remover) {
            let pool: Arc<dyn IdleRemovalPool> = sub_pool.clone();
            remover.register_pool(pool, timeout);
        }
    }

    /// Drop an empty sub-pool from the map.
    pub(crate) fn remove_sub_pool(&self, sub_pool: &ManagedConnectionPool) {
        let removed = {
            let mut sub_pools = self.sub_pools.lock();
            match sub_pools.get(sub_pool.credential()) {
                Some(current) if current.id() == sub_pool.id() && sub_pool.try_retire() => {
                    sub_pools.remove(sub_pool.credential())
                }
                _ => None,
            }
        };
        if let Some(removed) = removed {
            removed.release_background();
            tracing::debug!(
                pool = %self.shared.config.id,
                sub_pool = removed.id(),
                credential = %removed.credential(),
                "removed empty sub-pool"
            );
        }
    }

    pub(crate) fn flush(&self, mode: FlushMode) -> usize {
        let sub_pools: Vec<_> = self.sub_pools.lock().values().cloned().collect();
        sub_pools.iter().map(|s| s.flush(mode)).sum()
    }

    fn tracked_listener(&self, key: TransactionKey, sub_pool: u64) -> Option<Arc<ConnectionListener>> {
        let transactions = self.transactions.lock();
        let listener = transactions.get(&key)?.get(&sub_pool)?;
        (listener.state() == ListenerState::InUse).then(|| Arc::clone(listener))
    }

    fn track(&self, transaction: &Arc<dyn Transaction>, sub_pool: u64, listener: &Arc<ConnectionListener>) {
        let key = transaction.key();
        let first = {
            let mut transactions = self.transactions.lock();
            let first = !transactions.contains_key(&key);
            transactions
                .entry(key)
                .or_default()
                .insert(sub_pool, Arc::clone(listener));
            first
        };
        if !first {
            return;
        }

        let cleanup = Arc::new(TransactionMapCleanup {
            pool: self.self_ref.clone(),
            key,
        });
        if let Err(e) = transaction.register_synchronization(cleanup) {
            tracing::warn!(pool = %self.shared.config.id, tx = %key, error = %e, "could not track transaction");
            self.transactions.lock().remove(&key);
        }
    }

    fn shutdown(&self) {
        let sub_pools: Vec<_> = {
            let mut sub_pools = self.sub_pools.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            sub_pools.drain().map(|(_, s)| s).collect()
        };
        for sub_pool in &sub_pools {
            sub_pool.shutdown();
        }
        self.transactions.lock().clear();
        tracing::info!(pool = %self.shared.config.id, "connection pool shut down");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forgets a transaction's listeners once it completes.
struct TransactionMapCleanup {
    pool: Weak<PoolInner>,
    key: TransactionKey,
}

impl Synchronization for TransactionMapCleanup {
    fn before_completion(&self) {}

    fn after_completion(&self, _status: CompletionStatus) {
        if let Some(pool) = self.pool.upgrade() {
            pool.transactions.lock().remove(&self.key);
        }
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections destroyed.
    connections_destroyed: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (timeouts, creation failures).
    checkouts_failed: u64,
    /// Checkouts that timed out.
    blocking_failures: u64,
    /// Checkouts that had to wait.
    waits: u64,
    /// Connections removed for being idle.
    idle_timeouts: u64,
    /// Validations performed.
    validations_performed: u64,
    /// Validations that failed.
    validations_failed: u64,
    /// Peak number of live connections.
    max_used: u32,
    /// Sum of time spent acquiring.
    total_blocking_time: Duration,
    /// Longest acquisition.
    max_blocking_time: Duration,
}

impl Pool {
    /// Create a new pool builder.
    ///
    /// Use the builder to configure the pool before creating it.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool with the given configuration and factory.
    ///
    /// For more control over pool creation, use [`Pool::builder()`].
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ManagedConnectionFactory>,
    ) -> Result<Self, PoolError> {
        Self::builder().pool_config(config).factory(factory).build()
    }

    /// Pool name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.shared.config.id
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.shared.config
    }

    /// The transaction bound to the caller, unless the pool does not
    /// support transactions.
    #[must_use]
    pub fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        if self.config().transaction_support == TransactionSupportLevel::NoTransaction {
            return None;
        }
        self.inner.transaction_manager.as_ref()?.current_transaction()
    }

    /// Get a listener for `credential`.
    ///
    /// Inside an uncommitted transaction the listener already used by that
    /// transaction for the same sub-pool is returned again.
    pub async fn get_connection_listener(
        &self,
        credential: &Credential,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        let started = Instant::now();
        let transaction = self
            .current_transaction()
            .filter(|tx| tx.status().is_uncommitted());

        loop {
            let sub_pool = self.inner.sub_pool_for(credential)?;

            if let Some(tx) = &transaction {
                if let Some(listener) = self.inner.tracked_listener(tx.key(), sub_pool.id()) {
                    tracing::trace!(
                        pool = %self.id(),
                        listener = listener.id(),
                        tx = %tx.key(),
                        "reusing transaction's connection"
                    );
                    return Ok(listener);
                }
            }

            match sub_pool.acquire(credential, started).await {
                Ok(listener) => {
                    if let Some(tx) = &transaction {
                        self.inner.track(tx, sub_pool.id(), &listener);
                    }
                    return Ok(listener);
                }
                Err(PoolError::PoolShutdown(_)) if !self.is_shut_down() => {
                    tracing::debug!(pool = %self.id(), "sub-pool retired during acquisition; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a listener to its sub-pool, destroying it when `kill` is set.
    pub fn return_connection_listener(&self, listener: &Arc<ConnectionListener>, kill: bool) {
        listener.return_to_pool(kill);
    }

    /// The sub-pool currently serving `credential`, if one exists.
    #[must_use]
    pub fn managed_pool(&self, credential: &Credential) -> Option<Arc<ManagedConnectionPool>> {
        self.inner.sub_pool(credential)
    }

    /// Number of sub-pools.
    #[must_use]
    pub fn sub_pool_count(&self) -> usize {
        self.inner.sub_pools.lock().len()
    }

    /// Capacity not held by any physical connection.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.inner.shared.semaphore.available_permits()
    }

    /// Destroy listeners in every sub-pool according to `mode`.
    pub fn flush(&self, mode: FlushMode) -> usize {
        let destroyed = self.inner.flush(mode);
        tracing::info!(pool = %self.id(), mode = ?mode, destroyed, "pool flushed");
        destroyed
    }

    /// Fill the prefill sub-pool to `min_size`.
    pub fn prefill(&self) -> Result<(), PoolError> {
        let sub_pool = self.inner.sub_pool_for(&Credential::default())?;
        sub_pool.fill_to(self.config().min_size);
        Ok(())
    }

    /// Check that a connection can be obtained with the prefill credential.
    pub async fn test_connection(&self) -> bool {
        self.test_connection_with(&Credential::default()).await
    }

    /// Check that a connection can be obtained for `credential`.
    ///
    /// Returns `false` without waiting when every connection is in use.
    pub async fn test_connection_with(&self, credential: &Credential) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let status = self.status();
        if status.in_use >= status.max {
            return false;
        }
        let sub_pool = match self.inner.sub_pool_for(credential) {
            Ok(sub_pool) => sub_pool,
            Err(_) => return false,
        };
        match sub_pool.get_connection_listener(credential).await {
            Ok(listener) => {
                listener.return_to_pool(false);
                true
            }
            Err(e) => {
                tracing::debug!(pool = %self.id(), error = %e, "test connection failed");
                false
            }
        }
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let mut available = 0;
        let mut in_use = 0;
        for sub_pool in self.inner.sub_pools.lock().values() {
            available += sub_pool.free_count() as u32;
            in_use += sub_pool.in_use_count() as u32;
        }
        PoolStatus {
            available,
            in_use,
            total: available + in_use,
            max: self.config().max_size,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let shared = &self.inner.shared;
        let inner = shared.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_destroyed: inner.connections_destroyed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            blocking_failures: inner.blocking_failures,
            waits: inner.waits,
            idle_timeouts: inner.idle_timeouts,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            max_used: inner.max_used,
            total_blocking_time: inner.total_blocking_time,
            max_blocking_time: inner.max_blocking_time,
            uptime: shared.created_at.elapsed(),
        }
    }

    /// Destroy every connection and reject further acquisitions.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Check if the pool is shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .pool_config(pool_config)
///     .factory(factory)
///     .transaction_manager(tm)
///     .build()?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
    factory: Option<Arc<dyn ManagedConnectionFactory>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    validator: Option<Arc<ConnectionValidator>>,
    idle_remover: Option<Arc<IdleConnectionRemover>>,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            factory: None,
            transaction_manager: None,
            validator: None,
            idle_remover: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the physical connection factory.
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn ManagedConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the transaction manager used for enlistment.
    #[must_use]
    pub fn transaction_manager(mut self, tm: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(tm);
        self
    }

    /// Share a background validator with other pools.
    #[must_use]
    pub fn validator(mut self, validator: Arc<ConnectionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Share an idle connection remover with other pools.
    #[must_use]
    pub fn idle_remover(mut self, remover: Arc<IdleConnectionRemover>) -> Self {
        self.idle_remover = Some(remover);
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_size(mut self, size: u32) -> Self {
        self.pool_config.min_size = size;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, size: u32) -> Self {
        self.pool_config.max_size = size;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn blocking_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.blocking_timeout = timeout;
        self
    }

    /// Enable or disable prefill.
    #[must_use]
    pub fn prefill(mut self, enabled: bool) -> Self {
        self.pool_config.prefill = enabled;
        self
    }

    /// Enable background validation with the given interval.
    #[must_use]
    pub fn background_validation(mut self, interval: Duration) -> Self {
        self.pool_config.background_validation = true;
        self.pool_config.background_validation_interval = interval;
        self
    }

    /// Build the pool.
    ///
    /// A private validator or idle remover is created when the configuration
    /// needs one and none was supplied.
    pub fn build(self) -> Result<Pool, PoolError> {
        let config = self.pool_config;
        config.validate()?;
        let factory = self.factory.ok_or_else(|| {
            PoolError::InvalidConfig("a managed connection factory is required".into())
        })?;

        let validator = match self.validator {
            Some(validator) => Some(validator),
            None if config.background_validation => Some(Arc::new(ConnectionValidator::new())),
            None => None,
        };
        let idle_remover = match self.idle_remover {
            Some(remover) => Some(remover),
            None if config.idle_timeout.is_some() => Some(Arc::new(IdleConnectionRemover::new())),
            None => None,
        };

        if config.background_validation && factory.as_validating().is_none() {
            tracing::warn!(
                pool = %config.id,
                "background validation configured but the factory cannot validate"
            );
        }

        let shared = Arc::new(PoolShared {
            semaphore: Arc::new(Semaphore::new(config.max_size as usize)),
            config,
            factory,
            validator,
            idle_remover,
            next_listener_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        let inner = Arc::new_cyclic(|self_ref| PoolInner {
            shared: Arc::clone(&shared),
            transaction_manager: self.transaction_manager,
            sub_pools: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_sub_pool_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        });

        tracing::info!(
            pool = %shared.config.id,
            min = shared.config.min_size,
            max = shared.config.max_size,
            "connection pool created"
        );

        if shared.config.prefill {
            inner.sub_pool_for(&Credential::default())?;
        }

        Ok(Pool { inner })
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of free connections.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of live connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections destroyed since pool start.
    pub connections_destroyed: u64,
    /// Successful checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (timeouts, creation failures).
    pub checkouts_failed: u64,
    /// Checkouts that failed on the blocking timeout.
    pub blocking_failures: u64,
    /// Checkouts that had to wait for a connection.
    pub waits: u64,
    /// Connections destroyed by idle removal.
    pub idle_timeouts: u64,
    /// Validations performed.
    pub validations_performed: u64,
    /// Validations that failed.
    pub validations_failed: u64,
    /// Peak number of live connections.
    pub max_used: u32,
    /// Sum of the time spent acquiring connections.
    pub total_blocking_time: Duration,
    /// Longest single acquisition.
    pub max_blocking_time: Duration,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate validation success rate (0.0 to 1.0).
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        if self.validations_performed == 0 {
            return 1.0;
        }
        let successful = self.validations_performed - self.validations_failed;
        successful as f64 / self.validations_performed as f64
    }

    /// Mean time spent per checkout attempt.
    #[must_use]
    pub fn average_blocking_time(&self) -> Duration {
        let attempts = self.checkouts_successful + self.checkouts_failed;
        if attempts == 0 {
            return Duration::ZERO;
        }
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        self.total_blocking_time / attempts
    }

    /// Connections currently alive.
    #[must_use]
    pub fn live_connections(&self) -> u64 {
        self.connections_created
            .saturating_sub(self.connections_destroyed)
    }
}
