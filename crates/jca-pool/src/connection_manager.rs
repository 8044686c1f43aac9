//! Application entry point.
//!
//! [`ConnectionManager::allocate_connection`] gets a listener from the pool,
//! enlists it in the caller's transaction and opens a [`ConnectionHandle`] on
//! it. Closing (or dropping) the handle hands the listener back once it is
//! neither referenced nor enlisted.

use std::any::type_name;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jca_spi::Credential;

use crate::config::TransactionSupportLevel;
use crate::error::PoolError;
use crate::listener::ConnectionListener;
use crate::pool::Pool;

/// Allocates connection handles from a [`Pool`].
///
/// # Example
///
/// ```rust,ignore
/// let manager = ConnectionManager::new(pool);
/// let handle = manager.allocate_connection(&credential).await?;
/// handle.with_connection(|conn: &mut MyConnection| conn.execute("..."))?;
/// handle.close();
/// ```
pub struct ConnectionManager {
    pool: Pool,
    shutdown: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager over `pool`.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            shutdown: AtomicBool::new(false),
        }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Allocate a connection handle for `credential`.
    ///
    /// Inside an uncommitted transaction the connection is enlisted before the
    /// handle is returned. If enlistment or handle creation fails the
    /// connection is destroyed and the error is returned.
    pub async fn allocate_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionHandle, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ManagerShutdown);
        }

        let listener = self.acquire(credential).await?;

        if self.pool.config().transaction_support != TransactionSupportLevel::NoTransaction {
            if let Some(tx) = self.pool.current_transaction() {
                if tx.status().is_uncommitted() && listener.transaction_key() != Some(tx.key()) {
                    if let Err(e) = listener.enlist(tx) {
                        tracing::warn!(
                            pool = %self.pool.id(),
                            listener = listener.id(),
                            error = %e,
                            "enlistment failed; destroying connection"
                        );
                        self.pool.return_connection_listener(&listener, true);
                        return Err(e);
                    }
                }
            }
        }

        let handle = match listener.open_handle() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    pool = %self.pool.id(),
                    listener = listener.id(),
                    error = %e,
                    "opening connection handle failed; destroying connection"
                );
                self.pool.return_connection_listener(&listener, true);
                return Err(e);
            }
        };

        tracing::debug!(
            pool = %self.pool.id(),
            listener = listener.id(),
            handle,
            credential = %credential,
            "allocated connection"
        );
        Ok(ConnectionHandle {
            listener,
            id: handle,
            closed: false,
        })
    }

    async fn acquire(&self, credential: &Credential) -> Result<Arc<ConnectionListener>, PoolError> {
        let config = self.pool.config();
        let mut attempt = 0;
        loop {
            match self.pool.get_connection_listener(credential).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.is_transient() && attempt < config.allocation_retry => {
                    attempt += 1;
                    tracing::debug!(
                        pool = %self.pool.id(),
                        attempt,
                        error = %e,
                        "allocation failed; retrying"
                    );
                    tokio::time::sleep(config.allocation_retry_wait).await;
                    if self.is_shut_down() {
                        return Err(PoolError::ManagerShutdown);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach the handle's connection from its transaction.
    pub fn delist_connection(&self, handle: &ConnectionHandle) -> Result<(), PoolError> {
        if handle.is_closed() {
            return Err(PoolError::HandleClosed);
        }
        handle.listener.delist()
    }

    /// Stop allocating and shut the pool down.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.shutdown();
        tracing::info!(pool = %self.pool.id(), "connection manager shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// An application's handle on a pooled connection.
///
/// Several handles may share one connection inside a transaction. The
/// handle is closed on drop.
pub struct ConnectionHandle {
    listener: Arc<ConnectionListener>,
    id: u64,
    closed: bool,
}

impl ConnectionHandle {
    /// Handle id, unique per listener.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The listener this handle uses.
    #[must_use]
    pub fn listener(&self) -> &Arc<ConnectionListener> {
        &self.listener
    }

    /// Whether the handle is closed or its connection destroyed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed || self.listener.is_destroyed()
    }

    /// Run `f` against the physical connection, downcast to `C`.
    pub fn with_connection<C: 'static, R>(
        &self,
        f: impl FnOnce(&mut C) -> R,
    ) -> Result<R, PoolError> {
        if self.closed {
            return Err(PoolError::HandleClosed);
        }
        self.listener.with_connection(|connection| {
            connection
                .as_any_mut()
                .downcast_mut::<C>()
                .map(f)
                .ok_or(PoolError::ConnectionType {
                    expected: type_name::<C>(),
                })
        })?
    }

    /// Close the handle.
    pub fn close(mut self) {
        self.release();
    }

    /// Report a fatal error on the connection. The connection is destroyed
    /// and the pool's flush strategy applied.
    pub fn connection_error(mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener.connection_error_occurred(self.id);
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener.connection_closed(self.id);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("listener", &self.listener.id())
            .field("closed", &self.closed)
            .finish()
    }
}
