//! Background scanners.
//!
//! [`ConnectionValidator`] and [`IdleConnectionRemover`] share one scheduler:
//! a dedicated thread sleeping on a condition variable until the soonest
//! registrant is due. Registering a pool with a shorter interval wakes the
//! thread so it reschedules. The registry is copy-on-write; a pass runs
//! against a snapshot with the lock released, so registrants may register or
//! unregister from inside their own pass.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A pool whose free connections can be validated in the background.
pub trait ValidatingPool: Send + Sync {
    /// Validate the free connections that are due.
    fn validate_connections(&self);
}

/// A pool whose idle connections can be removed in the background.
pub trait IdleRemovalPool: Send + Sync {
    /// Destroy connections idle past the timeout.
    fn remove_idle_connections(&self);
}

struct Registration<P: ?Sized> {
    pool: Arc<P>,
    interval: Duration,
}

impl<P: ?Sized> Clone for Registration<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            interval: self.interval,
        }
    }
}

struct ScannerState<P: ?Sized> {
    registry: Arc<Vec<Registration<P>>>,
    /// `None` while nothing is registered.
    interval: Option<Duration>,
    next_scan: Option<Instant>,
    shutdown: bool,
    passes: u64,
}

struct Shared<P: ?Sized> {
    state: Mutex<ScannerState<P>>,
    wake: Condvar,
}

struct PoolScanner<P: ?Sized + Send + Sync + 'static> {
    name: &'static str,
    shared: Arc<Shared<P>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    action: fn(&P),
}

impl<P: ?Sized + Send + Sync + 'static> PoolScanner<P> {
    fn new(name: &'static str, action: fn(&P)) -> Self {
        Self {
            name,
            shared: Arc::new(Shared {
                state: Mutex::new(ScannerState {
                    registry: Arc::new(Vec::new()),
                    interval: None,
                    next_scan: None,
                    shutdown: false,
                    passes: 0,
                }),
                wake: Condvar::new(),
            }),
            thread: Mutex::new(None),
            action,
        }
    }

    fn register(&self, pool: Arc<P>, interval: Duration) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                tracing::debug!(scanner = self.name, "ignoring registration after shutdown");
                return;
            }

            Arc::make_mut(&mut state.registry).push(Registration { pool, interval });

            let candidate = (interval / 2).max(MIN_INTERVAL);
            let interval = state.interval.map_or(candidate, |current| current.min(candidate));
            state.interval = Some(interval);

            let next = Instant::now() + interval;
            if state.next_scan.is_none_or(|scheduled| next < scheduled) {
                state.next_scan = Some(next);
                self.shared.wake.notify_one();
            }

            tracing::debug!(
                scanner = self.name,
                pools = state.registry.len(),
                interval_ms = interval.as_millis() as u64,
                "pool registered"
            );
        }
        self.ensure_started();
    }

    fn unregister(&self, pool: &Arc<P>) {
        let mut state = self.shared.state.lock();
        let before = state.registry.len();
        Arc::make_mut(&mut state.registry)
            .retain(|r| !std::ptr::addr_eq(Arc::as_ptr(&r.pool), Arc::as_ptr(pool)));
        if state.registry.len() == before {
            return;
        }

        state.interval = state
            .registry
            .iter()
            .map(|r| (r.interval / 2).max(MIN_INTERVAL))
            .min();
        if state.interval.is_none() {
            state.next_scan = None;
        }

        tracing::debug!(
            scanner = self.name,
            pools = state.registry.len(),
            "pool unregistered"
        );
    }

    fn ensure_started(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let name = self.name;
        let action = self.action;
        match thread::Builder::new()
            .name(format!("jca-{name}"))
            .spawn(move || run(name, &shared, action))
        {
            Ok(handle) => {
                tracing::info!(scanner = name, "background scanner started");
                *thread = Some(handle);
            }
            Err(e) => {
                tracing::warn!(scanner = name, error = %e, "failed to start background scanner");
            }
        }
    }

    fn interval(&self) -> Option<Duration> {
        self.shared.state.lock().interval
    }

    fn passes(&self) -> u64 {
        self.shared.state.lock().passes
    }

    fn pool_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.shared.state.lock().shutdown
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.registry = Arc::new(Vec::new());
            state.interval = None;
            state.next_scan = None;
            self.shared.wake.notify_all();
        }

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::warn!(scanner = self.name, "background scanner panicked");
        }
        tracing::info!(scanner = self.name, "background scanner stopped");
    }
}

impl<P: ?Sized + Send + Sync + 'static> Drop for PoolScanner<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<P: ?Sized + Send + Sync>(name: &'static str, shared: &Shared<P>, action: fn(&P)) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.next_scan {
            Some(at) => {
                shared.wake.wait_until(&mut state, at);
            }
            None => shared.wake.wait(&mut state),
        }
        if state.shutdown {
            break;
        }
        if state.registry.is_empty() {
            state.next_scan = None;
            continue;
        }

        // Registrants may drop their last reference inside the pass; release
        // the snapshot before relocking.
        let snapshot = Arc::clone(&state.registry);
        MutexGuard::unlocked(&mut state, move || {
            scan(name, &snapshot, action);
            drop(snapshot);
        });

        state.passes += 1;
        state.next_scan = state.interval.map(|interval| Instant::now() + interval);
    }
}

fn scan<P: ?Sized>(name: &'static str, registry: &[Registration<P>], action: fn(&P)) {
    for registration in registry {
        let pool = &*registration.pool;
        if catch_unwind(AssertUnwindSafe(|| action(pool))).is_err() {
            tracing::warn!(scanner = name, "pool scan panicked; continuing with the next pool");
        }
    }
}

/// Background validation of free connections.
///
/// Runs [`ValidatingPool::validate_connections`] on every registered pool.
/// The wake interval is the minimum over half of each registrant's
/// validation interval.
///
/// ```rust,ignore
/// let validator = Arc::new(ConnectionValidator::new());
/// let pool = Pool::builder()
///     .factory(factory)
///     .background_validation(Duration::from_secs(60))
///     .validator(Arc::clone(&validator))
///     .build()?;
/// ```
pub struct ConnectionValidator {
    scanner: PoolScanner<dyn ValidatingPool>,
}

impl ConnectionValidator {
    /// Create a validator. Its thread starts on first registration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scanner: PoolScanner::<dyn ValidatingPool>::new("validator", |pool| {
                pool.validate_connections();
            }),
        }
    }

    /// Register a pool validated every `interval`.
    pub fn register_pool(&self, pool: Arc<dyn ValidatingPool>, interval: Duration) {
        self.scanner.register(pool, interval);
    }

    /// Remove a pool from the registry.
    pub fn unregister_pool(&self, pool: &Arc<dyn ValidatingPool>) {
        self.scanner.unregister(pool);
    }

    /// Current wake interval, `None` when nothing is registered.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.scanner.interval()
    }

    /// Number of completed passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.scanner.passes()
    }

    /// Number of registered pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.scanner.pool_count()
    }

    /// Whether the background thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scanner.is_running()
    }

    /// Stop the background thread. Later registrations are ignored.
    pub fn shutdown(&self) {
        self.scanner.shutdown();
    }
}

impl Default for ConnectionValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Background removal of idle connections.
///
/// Same scheduling as [`ConnectionValidator`], driving
/// [`IdleRemovalPool::remove_idle_connections`].
pub struct IdleConnectionRemover {
    scanner: PoolScanner<dyn IdleRemovalPool>,
}

impl IdleConnectionRemover {
    /// Create a remover. Its thread starts on first registration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scanner: PoolScanner::<dyn IdleRemovalPool>::new("idle-remover", |pool| {
                pool.remove_idle_connections();
            }),
        }
    }

    /// Register a pool whose connections time out after `idle_timeout`.
    pub fn register_pool(&self, pool: Arc<dyn IdleRemovalPool>, idle_timeout: Duration) {
        self.scanner.register(pool, idle_timeout);
    }

    /// Remove a pool from the registry.
    pub fn unregister_pool(&self, pool: &Arc<dyn IdleRemovalPool>) {
        self.scanner.unregister(pool);
    }

    /// Current wake interval, `None` when nothing is registered.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.scanner.interval()
    }

    /// Number of completed passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.scanner.passes()
    }

    /// Number of registered pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.scanner.pool_count()
    }

    /// Stop the background thread.
    pub fn shutdown(&self) {
        self.scanner.shutdown();
    }
}

impl Default for IdleConnectionRemover {
    fn default() -> Self {
        Self::new()
    }
}
