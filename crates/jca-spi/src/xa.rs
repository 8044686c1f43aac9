//! Two-phase-commit participation.

use std::fmt;

use crate::error::XaError;

/// A transaction branch identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    global_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum length of the global id and branch qualifier.
    pub const MAX_PART_LEN: usize = 64;

    /// Create an XID. Parts longer than [`Xid::MAX_PART_LEN`] are truncated.
    pub fn new(format_id: i32, global_id: &[u8], branch_qualifier: &[u8]) -> Self {
        let clip = |b: &[u8]| b[..b.len().min(Self::MAX_PART_LEN)].to_vec();
        Self {
            format_id,
            global_id: clip(global_id),
            branch_qualifier: clip(branch_qualifier),
        }
    }

    /// Get the format identifier.
    #[must_use]
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Get the global transaction id.
    #[must_use]
    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    /// Get the branch qualifier.
    #[must_use]
    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Flags passed to [`XaResource::start`] and [`XaResource::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaFlag {
    /// No flags.
    NoFlags,
    /// Join an existing branch.
    Join,
    /// Resume a suspended branch.
    Resume,
    /// Work on the branch completed successfully.
    Success,
    /// Work on the branch failed; the branch must roll back.
    Fail,
    /// Suspend the branch.
    Suspend,
}

/// Result of the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaVote {
    /// The branch is prepared and can commit.
    Ok,
    /// The branch did no updates and is already complete.
    ReadOnly,
}

/// A resource that can take part in a distributed transaction.
///
/// Methods take `&self` because the transaction manager shares the resource
/// with the pool. Implementations use interior mutability.
pub trait XaResource: Send + Sync {
    /// Start work on behalf of a branch.
    fn start(&self, xid: &Xid, flag: XaFlag) -> Result<(), XaError>;

    /// End work on behalf of a branch.
    fn end(&self, xid: &Xid, flag: XaFlag) -> Result<(), XaError>;

    /// Ask the resource manager to prepare the branch.
    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError>;

    /// Commit the branch.
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Roll back the branch.
    fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Forget a heuristically completed branch.
    fn forget(&self, _xid: &Xid) -> Result<(), XaError> {
        Ok(())
    }

    /// List prepared branches.
    fn recover(&self) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    /// Set the branch timeout in seconds. Returns `false` if unsupported.
    fn set_transaction_timeout(&self, _seconds: u32) -> Result<bool, XaError> {
        Ok(false)
    }

    /// Whether `other` talks to the same resource manager.
    fn is_same_rm(&self, _other: &dyn XaResource) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_truncates_parts() {
        let long = [7u8; 100];
        let xid = Xid::new(1, &long, b"b1");
        assert_eq!(xid.global_id().len(), Xid::MAX_PART_LEN);
        assert_eq!(xid.branch_qualifier(), b"b1");
    }

    #[test]
    fn test_xid_debug_hex() {
        let xid = Xid::new(42, &[0x0a, 0xff], &[0x01]);
        assert_eq!(format!("{xid:?}"), "Xid(42:0aff:01)");
    }
}
