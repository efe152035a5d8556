//! Periodic snapshotting and log compaction.
//!
//! A checkpoint captures state and its log position together, writes the
//! snapshot, and only then truncates the log through the oldest snapshot it
//! still retains. The log is never truncated past a durable snapshot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::CheckpointError;
use crate::handler::CommandPipeline;
use crate::sequence::SequenceNumber;
use crate::snapshot::SnapshotStore;
use crate::state::{EventSourced, SharedState};
use crate::wal::WalPort;

/// When to checkpoint and how many snapshots to retain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Entries appended since the last checkpoint before another is due.
    pub min_events_between: u64,
    /// Snapshots kept after purging, newest first. At least one is always kept.
    pub keep_snapshots: usize,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            min_events_between: 1000,
            keep_snapshots: 2,
        }
    }
}

/// Summary of a completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Sequence the new snapshot was tagged with.
    pub sequence: SequenceNumber,
    /// Log entries at or before this were discarded.
    pub truncated_through: SequenceNumber,
    /// Older snapshots removed.
    pub purged: usize,
}

pub struct Checkpointer<S: EventSourced> {
    pipeline: CommandPipeline<S::Payload>,
    snapshots: Arc<dyn SnapshotStore<S>>,
    state: SharedState<S>,
    policy: CheckpointPolicy,
    /// Sequences of snapshots written by this checkpointer, oldest first.
    written: Mutex<VecDeque<SequenceNumber>>,
}

impl<S: EventSourced> Checkpointer<S> {
    pub fn new(
        pipeline: CommandPipeline<S::Payload>,
        snapshots: Arc<dyn SnapshotStore<S>>,
        state: SharedState<S>,
    ) -> Self {
        Self {
            pipeline,
            snapshots,
            state,
            policy: CheckpointPolicy::default(),
            written: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record the snapshot recovery started from, so it counts toward retention.
    pub fn with_recovered_snapshot(mut self, sequence: Option<SequenceNumber>) -> Self {
        if let Some(sequence) = sequence {
            self.written.get_mut().push_back(sequence);
        }
        self
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Checkpoint only if enough entries were appended since the last one.
    pub async fn checkpoint_if_due(&self) -> Result<Option<CheckpointReport>, CheckpointError> {
        let last = self
            .written
            .lock()
            .await
            .back()
            .copied()
            .unwrap_or_else(SequenceNumber::start);
        let current = self.wal().current_sequence().await;
        if current.value().saturating_sub(last.value()) < self.policy.min_events_between {
            return Ok(None);
        }
        self.checkpoint().await.map(Some)
    }

    /// Snapshot the current state, compact the log, purge old snapshots.
    ///
    /// The log is truncated only through the oldest retained snapshot, so
    /// every retained snapshot can still be completed by replay.
    pub async fn checkpoint(&self) -> Result<CheckpointReport, CheckpointError> {
        let mut written = self.written.lock().await;

        let (state, sequence) = {
            let _quiesced = self.pipeline.quiesce().await;
            let sequence = self.wal().current_sequence().await;
            (self.state.capture(), sequence)
        };

        self.snapshots.create_snapshot(&state, sequence).await?;
        written.push_back(sequence);
        info!(%sequence, "snapshot written");

        let keep = self.policy.keep_snapshots.max(1);
        while written.len() > keep {
            written.pop_front();
        }
        let oldest_kept = written.front().copied().unwrap_or(sequence);

        self.wal().truncate(oldest_kept).await?;

        let purged = match self.snapshots.purge_older_snapshots(oldest_kept).await {
            Ok(purged) => purged,
            Err(err) => {
                warn!(error = %err, "snapshot purge failed, will retry next checkpoint");
                0
            }
        };

        info!(%sequence, truncated_through = %oldest_kept, purged, "checkpoint complete");
        Ok(CheckpointReport {
            sequence,
            truncated_through: oldest_kept,
            purged,
        })
    }

    fn wal(&self) -> &Arc<dyn WalPort<S::Payload>> {
        self.pipeline.wal()
    }
}
