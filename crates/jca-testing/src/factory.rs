//! Mock connection factory.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use jca_spi::{
    Credential, ManagedConnection, ManagedConnectionFactory, ResourceError,
    ValidatingConnectionFactory, XaResource,
};
use parking_lot::Mutex;

use crate::xa::{MockXaResource, XaEvent};

#[derive(Default)]
struct Counters {
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    destroy_attempts: AtomicU64,
    cleanups: AtomicU64,
    validations: AtomicU64,
    handles_opened: AtomicU64,
}

#[derive(Default)]
struct Switches {
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    fail_cleanup: AtomicBool,
    fail_open_handle: AtomicBool,
    fail_xa_resource: AtomicBool,
    all_invalid: AtomicBool,
}

#[derive(Default)]
struct State {
    counters: Counters,
    switches: Switches,
    fail_prepare: Arc<AtomicBool>,
    create_delay: Mutex<Duration>,
    invalid: Mutex<HashSet<u64>>,
    credentials: Mutex<Vec<Credential>>,
    xa_log: Arc<Mutex<Vec<XaEvent>>>,
}

/// A [`ManagedConnectionFactory`] whose connections live in memory.
///
/// Every observable effect is counted, and every failure mode can be
/// switched on at runtime. Clones share the same state.
#[derive(Clone)]
pub struct MockConnectionFactory {
    state: Arc<State>,
    validating: bool,
}

impl MockConnectionFactory {
    /// A factory that also validates connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(State::default()),
            validating: true,
        }
    }

    /// A factory without validation support.
    #[must_use]
    pub fn non_validating() -> Self {
        Self {
            validating: false,
            ..Self::new()
        }
    }

    /// Make creation fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.state.switches.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `destroy` fail.
    pub fn set_fail_destroy(&self, fail: bool) {
        self.state.switches.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Make `cleanup` fail.
    pub fn set_fail_cleanup(&self, fail: bool) {
        self.state.switches.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    /// Make `open_handle` fail.
    pub fn set_fail_open_handle(&self, fail: bool) {
        self.state
            .switches
            .fail_open_handle
            .store(fail, Ordering::SeqCst);
    }

    /// Make `xa_resource` fail.
    pub fn set_fail_xa_resource(&self, fail: bool) {
        self.state
            .switches
            .fail_xa_resource
            .store(fail, Ordering::SeqCst);
    }

    /// Make XA `prepare` vote rollback.
    pub fn set_fail_prepare(&self, fail: bool) {
        self.state.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every creation.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.state.create_delay.lock() = delay;
    }

    /// Fail validation of connection `id`.
    pub fn invalidate(&self, id: u64) {
        self.state.invalid.lock().insert(id);
    }

    /// Fail validation of every connection.
    pub fn set_all_invalid(&self, invalid: bool) {
        self.state.switches.all_invalid.store(invalid, Ordering::SeqCst);
    }

    /// Connections created.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.state.counters.created.load(Ordering::SeqCst)
    }

    /// Connections destroyed successfully.
    #[must_use]
    pub fn destroyed(&self) -> u64 {
        self.state.counters.destroyed.load(Ordering::SeqCst)
    }

    /// Calls to `destroy`, failed ones included.
    #[must_use]
    pub fn destroy_attempts(&self) -> u64 {
        self.state.counters.destroy_attempts.load(Ordering::SeqCst)
    }

    /// Connections created and not yet destroyed.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.destroy_attempts())
    }

    /// Calls to `cleanup`.
    #[must_use]
    pub fn cleanups(&self) -> u64 {
        self.state.counters.cleanups.load(Ordering::SeqCst)
    }

    /// Calls to `validate`.
    #[must_use]
    pub fn validations(&self) -> u64 {
        self.state.counters.validations.load(Ordering::SeqCst)
    }

    /// Calls to `open_handle`.
    #[must_use]
    pub fn handles_opened(&self) -> u64 {
        self.state.counters.handles_opened.load(Ordering::SeqCst)
    }

    /// Credentials passed to creation, in order.
    #[must_use]
    pub fn created_credentials(&self) -> Vec<Credential> {
        self.state.credentials.lock().clone()
    }

    /// XA calls made on any connection of this factory.
    #[must_use]
    pub fn xa_events(&self) -> Vec<XaEvent> {
        self.state.xa_log.lock().clone()
    }

    /// Forget recorded XA calls.
    pub fn clear_xa_events(&self) {
        self.state.xa_log.lock().clear();
    }
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedConnectionFactory for MockConnectionFactory {
    fn create_managed_connection(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn ManagedConnection>, ResourceError> {
        let delay = *self.state.create_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.state.switches.fail_create.load(Ordering::SeqCst) {
            return Err(ResourceError::CreationFailed("mock creation refused".into()));
        }

        let id = self.state.counters.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.counters.created.fetch_add(1, Ordering::SeqCst);
        self.state.credentials.lock().push(credential.clone());
        tracing::trace!(connection = id, credential = %credential, "mock connection created");

        Ok(Box::new(MockManagedConnection {
            id,
            credential: credential.clone(),
            xa: Arc::new(MockXaResource::new(
                id,
                Arc::clone(&self.state.xa_log),
                Arc::clone(&self.state.fail_prepare),
            )),
            open_handles: 0,
            destroyed: false,
            state: Arc::clone(&self.state),
        }))
    }

    fn as_validating(&self) -> Option<&dyn ValidatingConnectionFactory> {
        if self.validating {
            Some(self as &dyn ValidatingConnectionFactory)
        } else {
            None
        }
    }
}

impl ValidatingConnectionFactory for MockConnectionFactory {
    fn validate(&self, connection: &mut dyn ManagedConnection) -> Result<(), ResourceError> {
        self.state.counters.validations.fetch_add(1, Ordering::SeqCst);
        let connection = connection
            .as_any()
            .downcast_ref::<MockManagedConnection>()
            .ok_or_else(|| ResourceError::Invalid("foreign connection".into()))?;
        if connection.destroyed {
            return Err(ResourceError::Closed);
        }
        if self.state.switches.all_invalid.load(Ordering::SeqCst)
            || self.state.invalid.lock().contains(&connection.id)
        {
            return Err(ResourceError::Invalid(format!(
                "connection {} marked invalid",
                connection.id
            )));
        }
        Ok(())
    }
}

/// A connection made by [`MockConnectionFactory`].
pub struct MockManagedConnection {
    id: u64,
    credential: Credential,
    xa: Arc<MockXaResource>,
    open_handles: u32,
    destroyed: bool,
    state: Arc<State>,
}

impl MockManagedConnection {
    /// Connection id, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credential the connection was created for.
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Handles currently open.
    #[must_use]
    pub fn open_handles(&self) -> u32 {
        self.open_handles
    }
}

impl ManagedConnection for MockManagedConnection {
    fn open_handle(&mut self, _credential: &Credential) -> Result<(), ResourceError> {
        if self.destroyed {
            return Err(ResourceError::Closed);
        }
        if self.state.switches.fail_open_handle.load(Ordering::SeqCst) {
            return Err(ResourceError::Other("mock handle refused".into()));
        }
        self.open_handles += 1;
        self.state.counters.handles_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close_handle(&mut self) {
        self.open_handles = self.open_handles.saturating_sub(1);
    }

    fn cleanup(&mut self) -> Result<(), ResourceError> {
        self.state.counters.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.state.switches.fail_cleanup.load(Ordering::SeqCst) {
            return Err(ResourceError::Other("mock cleanup refused".into()));
        }
        self.open_handles = 0;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), ResourceError> {
        self.state
            .counters
            .destroy_attempts
            .fetch_add(1, Ordering::SeqCst);
        if self.state.switches.fail_destroy.load(Ordering::SeqCst) {
            return Err(ResourceError::Other("mock destroy refused".into()));
        }
        self.destroyed = true;
        self.state.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn xa_resource(&self) -> Result<Arc<dyn XaResource>, ResourceError> {
        if self.state.switches.fail_xa_resource.load(Ordering::SeqCst) {
            return Err(ResourceError::Other("mock XA resource unavailable".into()));
        }
        Ok(Arc::clone(&self.xa) as Arc<dyn XaResource>)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
