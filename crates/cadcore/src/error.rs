//! Error kinds surfaced by the core.
//!
//! | Error | Raised | State afterwards |
//! |-------|--------|------------------|
//! | [`ValidationError`] | while preparing, before any log write | unchanged |
//! | [`WalError`] | the durable write failed or was not confirmed | unchanged |
//! | [`LockError`] | while acquiring a multi-key scope | unchanged, no partial locks held |
//! | [`SnapshotReadError`] | startup recovery | nothing restored |
//! | [`SnapshotWriteError`] | checkpointing | live processing unaffected |
//!
//! Nothing here is retried internally. Retries belong to the caller.

use std::time::Duration;
use thiserror::Error;

use crate::lock::LockKey;
use crate::sequence::SequenceNumber;

/// A sequence number was constructed from a non-positive value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence number must be positive, got {value}")]
    NotPositive { value: u64 },

    #[error("sequence space exhausted advancing {count} from {from}")]
    Exhausted { from: u64, count: u64 },
}

/// A lock scope could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("lock scope must contain at least one key")]
    Empty,
}

/// A command was rejected by its preparation hook.
///
/// Fully recoverable: nothing was written and no state changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The durable log failed to record or read entries.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("log corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("log write rejected: {reason}")]
    Rejected { reason: String },

    #[error("cannot replay after {requested}: log already truncated through {floor}")]
    Truncated {
        requested: SequenceNumber,
        floor: SequenceNumber,
    },

    #[error("refusing to truncate through {requested}: latest durable snapshot is at {snapshot:?}")]
    TruncateBeyondSnapshot {
        requested: SequenceNumber,
        snapshot: Option<SequenceNumber>,
    },
}

impl WalError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// A lock scope could not be fully acquired.
///
/// Every lock taken earlier in the same call has already been released.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock {key} is held by another task")]
    Contended { key: LockKey },

    #[error("timed out after {after:?} waiting for lock {key}")]
    TimedOut { key: LockKey, after: Duration },
}

/// The latest snapshot could not be read.
#[derive(Debug, Error)]
pub enum SnapshotReadError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot deserialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot invalid: {reason}")]
    Invalid { reason: String },
}

/// A snapshot could not be written or purged.
#[derive(Debug, Error)]
pub enum SnapshotWriteError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot write rejected: {reason}")]
    Rejected { reason: String },
}

/// Failure surfaced by [`CommandPipeline::handle`](crate::CommandPipeline::handle).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("durability failure: {0}")]
    Durability(#[from] WalError),

    #[error("lock acquisition failure: {0}")]
    LockAcquisition(#[from] LockError),

    /// The runtime stopped the write task. Whether the event is durable is
    /// known only after recovery.
    #[error("command interrupted before its write completed")]
    Interrupted,
}

impl CommandError {
    /// True when the same command may be resubmitted without changes.
    ///
    /// Validation failures need corrected input; durability and lock
    /// failures left no trace and can be retried as-is. An interrupted
    /// command may already be in the log.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CommandError::Validation(_) | CommandError::Interrupted
        )
    }
}

/// Startup recovery failed. Requires operator intervention.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("cannot load snapshot: {0}")]
    Snapshot(#[from] SnapshotReadError),

    #[error("cannot replay log: {0}")]
    Replay(#[from] WalError),
}

/// A checkpoint did not complete.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cannot write snapshot: {0}")]
    Snapshot(#[from] SnapshotWriteError),

    #[error("cannot compact log: {0}")]
    Log(#[from] WalError),
}
