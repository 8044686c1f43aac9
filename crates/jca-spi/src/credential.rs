//! Credentials used to partition pools.
//!
//! A [`Credential`] is the pair of a security [`Subject`] and the
//! [`ConnectionRequestInfo`] supplied by the application. Two requests that
//! carry equal credentials may share physical connections; requests with
//! different credentials never do.

use std::collections::BTreeMap;
use std::fmt;

/// A security principal with an optional private credential.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    principal: String,
    secret: Option<String>,
}

impl Subject {
    /// Create a subject for the given principal name.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: None,
        }
    }

    /// Attach a private credential (a password or token).
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Get the principal name.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Get the private credential, if any.
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("principal", &self.principal)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Connection request parameters supplied by the application.
///
/// Keys are kept sorted so that equality and hashing do not depend on
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConnectionRequestInfo {
    properties: BTreeMap<String, String>,
}

impl ConnectionRequestInfo {
    /// Create an empty set of request parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Iterate over all parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// The key identifying a sub-pool.
///
/// `Credential::default()` carries neither a subject nor request info and is
/// the credential used to prefill a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Credential {
    subject: Option<Subject>,
    request_info: Option<ConnectionRequestInfo>,
}

impl Credential {
    /// Create a credential.
    pub fn new(subject: Option<Subject>, request_info: Option<ConnectionRequestInfo>) -> Self {
        Self {
            subject,
            request_info,
        }
    }

    /// Shorthand for a credential with only a principal name.
    pub fn principal(name: impl Into<String>) -> Self {
        Self::new(Some(Subject::new(name)), None)
    }

    /// Get the subject.
    #[must_use]
    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// Get the connection request info.
    #[must_use]
    pub fn request_info(&self) -> Option<&ConnectionRequestInfo> {
        self.request_info.as_ref()
    }

    /// Whether this is the prefill credential.
    #[must_use]
    pub fn is_prefill(&self) -> bool {
        self.subject.is_none() && self.request_info.is_none()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.subject, &self.request_info) {
            (None, None) => f.write_str("<prefill>"),
            (Some(s), None) => write!(f, "{}", s.principal),
            (None, Some(cri)) => write!(f, "<anonymous>[{} params]", cri.len()),
            (Some(s), Some(cri)) => write!(f, "{}[{} params]", s.principal, cri.len()),
        }
    }
}
