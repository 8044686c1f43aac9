//! Recording XA resource.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jca_spi::{XaError, XaFlag, XaResource, XaVote, Xid};
use parking_lot::Mutex;

/// One call made on a [`MockXaResource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaEvent {
    /// `start` was called.
    Start {
        /// Connection id.
        connection: u64,
        /// Branch id.
        xid: Xid,
        /// Flag passed.
        flag: XaFlag,
    },
    /// `end` was called.
    End {
        /// Connection id.
        connection: u64,
        /// Branch id.
        xid: Xid,
        /// Flag passed.
        flag: XaFlag,
    },
    /// `prepare` was called.
    Prepare {
        /// Connection id.
        connection: u64,
        /// Branch id.
        xid: Xid,
    },
    /// `commit` was called.
    Commit {
        /// Connection id.
        connection: u64,
        /// Branch id.
        xid: Xid,
        /// One-phase optimization.
        one_phase: bool,
    },
    /// `rollback` was called.
    Rollback {
        /// Connection id.
        connection: u64,
        /// Branch id.
        xid: Xid,
    },
}

impl XaEvent {
    /// Short name of the call.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::End { .. } => "end",
            Self::Prepare { .. } => "prepare",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
        }
    }

    /// Connection the call was made on.
    #[must_use]
    pub fn connection(&self) -> u64 {
        match self {
            Self::Start { connection, .. }
            | Self::End { connection, .. }
            | Self::Prepare { connection, .. }
            | Self::Commit { connection, .. }
            | Self::Rollback { connection, .. } => *connection,
        }
    }
}

/// XA resource of a mock connection.
///
/// Events go to a log shared with the factory that created the connection.
pub struct MockXaResource {
    connection: u64,
    log: Arc<Mutex<Vec<XaEvent>>>,
    fail_prepare: Arc<AtomicBool>,
}

impl MockXaResource {
    pub(crate) fn new(
        connection: u64,
        log: Arc<Mutex<Vec<XaEvent>>>,
        fail_prepare: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            log,
            fail_prepare,
        }
    }

    fn record(&self, event: XaEvent) {
        self.log.lock().push(event);
    }
}

impl XaResource for MockXaResource {
    fn start(&self, xid: &Xid, flag: XaFlag) -> Result<(), XaError> {
        self.record(XaEvent::Start {
            connection: self.connection,
            xid: xid.clone(),
            flag,
        });
        Ok(())
    }

    fn end(&self, xid: &Xid, flag: XaFlag) -> Result<(), XaError> {
        self.record(XaEvent::End {
            connection: self.connection,
            xid: xid.clone(),
            flag,
        });
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError> {
        self.record(XaEvent::Prepare {
            connection: self.connection,
            xid: xid.clone(),
        });
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(XaError::Rollback("prepare refused".into()));
        }
        Ok(XaVote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.record(XaEvent::Commit {
            connection: self.connection,
            xid: xid.clone(),
            one_phase,
        });
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(XaEvent::Rollback {
            connection: self.connection,
            xid: xid.clone(),
        });
        Ok(())
    }

    fn is_same_rm(&self, _other: &dyn XaResource) -> bool {
        false
    }
}
