//! Point-in-time captures of operational state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SnapshotReadError, SnapshotWriteError};
use crate::sequence::SequenceNumber;

/// State tagged with the log position it reflects.
///
/// `sequence` is the last log entry whose effect is included in `state`.
/// Replaying the log strictly after `sequence` reproduces everything since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    state: S,
    sequence: SequenceNumber,
}

impl<S> Snapshot<S> {
    pub fn new(state: S, sequence: SequenceNumber) -> Self {
        Self { state, sequence }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn into_parts(self) -> (S, SequenceNumber) {
        (self.state, self.sequence)
    }
}

/// Contract for snapshot storage.
///
/// - `create_snapshot` is atomic: readers never observe a half-written file.
/// - `load_latest_snapshot` returns the newest readable snapshot, if any.
/// - `purge_older_snapshots` must not block command processing.
#[async_trait]
pub trait SnapshotStore<S: Send + Sync + 'static>: Send + Sync {
    async fn create_snapshot(
        &self,
        state: &S,
        up_to: SequenceNumber,
    ) -> Result<(), SnapshotWriteError>;

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot<S>>, SnapshotReadError>;

    /// Remove snapshots whose sequence is strictly less than `keep_after`.
    /// Returns how many were removed.
    async fn purge_older_snapshots(
        &self,
        keep_after: SequenceNumber,
    ) -> Result<usize, SnapshotWriteError>;
}
