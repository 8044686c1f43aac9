//! Physical connection contracts.

use std::any::Any;
use std::sync::Arc;

use crate::credential::Credential;
use crate::error::ResourceError;
use crate::xa::XaResource;

/// Creates physical connections to a resource.
pub trait ManagedConnectionFactory: Send + Sync {
    /// Open a new physical connection for `credential`.
    ///
    /// Called from a blocking worker thread; implementations may block.
    fn create_managed_connection(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn ManagedConnection>, ResourceError>;

    /// Validation capability, if the factory supports it.
    fn as_validating(&self) -> Option<&dyn ValidatingConnectionFactory> {
        None
    }
}

/// Factory capability that checks physical connections for validity.
pub trait ValidatingConnectionFactory: Send + Sync {
    /// Check a connection. An error means the connection must be destroyed.
    fn validate(&self, connection: &mut dyn ManagedConnection) -> Result<(), ResourceError>;
}

/// A physical, reusable connection to a resource.
pub trait ManagedConnection: Send {
    /// Prepare the connection for a new application handle.
    fn open_handle(&mut self, credential: &Credential) -> Result<(), ResourceError>;

    /// Called when an application handle is closed.
    fn close_handle(&mut self) {}

    /// Reset per-use state before the connection goes back to the pool.
    fn cleanup(&mut self) -> Result<(), ResourceError>;

    /// Close the physical connection.
    fn destroy(&mut self) -> Result<(), ResourceError>;

    /// The XA resource used to enlist this connection in transactions.
    fn xa_resource(&self) -> Result<Arc<dyn XaResource>, ResourceError>;

    /// Upcast for typed access.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed access.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
