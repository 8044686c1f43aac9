//! # jca-spi
//!
//! Contracts between a managed connection pool and the systems around it.
//!
//! This crate contains no pooling logic. It describes the boundary the pool
//! is written against:
//!
//! ## Features
//!
//! - [`Credential`] partitioning key (security subject plus request parameters)
//! - [`ManagedConnectionFactory`] / [`ManagedConnection`] for physical connections
//! - [`ValidatingConnectionFactory`] as an explicit validation capability
//! - [`XaResource`] and [`Xid`] for two-phase-commit participation
//! - [`TransactionManager`], [`Transaction`] and [`Synchronization`] callbacks
//!
//! ## Example
//!
//! ```rust,ignore
//! use jca_spi::{Credential, ManagedConnectionFactory, Subject};
//!
//! let credential = Credential::new(Some(Subject::new("app_user")), None);
//! let connection = factory.create_managed_connection(&credential)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod credential;
pub mod error;
pub mod transaction;
pub mod xa;

// Credentials
pub use credential::{ConnectionRequestInfo, Credential, Subject};

// Connection contracts
pub use connection::{ManagedConnection, ManagedConnectionFactory, ValidatingConnectionFactory};

// Error types
pub use error::{ResourceError, TransactionError, XaError};

// Transaction contracts
pub use transaction::{
    CompletionStatus, Synchronization, Transaction, TransactionKey, TransactionManager,
    TransactionStatus,
};

// XA
pub use xa::{XaFlag, XaResource, XaVote, Xid};
