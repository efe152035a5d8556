//! Startup recovery: newest snapshot, then the log tail after it.
//!
//! ```text
//! load_latest_snapshot()
//!     ├─ Some(snap) ─► state = snap.state ─► replay_from(snap.sequence)
//!     └─ None ───────► state = default    ─► replay()
//!                                              │
//!                                              ▼
//!                          next write = current_sequence().next()
//! ```

use tracing::info;

use crate::error::RecoveryError;
use crate::sequence::SequenceNumber;
use crate::snapshot::SnapshotStore;
use crate::state::EventSourced;
use crate::wal::{LogEntry, WalPort};

/// Outcome of [`recover`].
#[derive(Debug, Clone)]
pub struct Recovered<S> {
    pub state: S,
    /// Sequence of the snapshot recovery started from, if one existed.
    pub snapshot_sequence: Option<SequenceNumber>,
    /// Number of log entries applied on top of the snapshot.
    pub replayed: usize,
    /// Highest sequence in the log when recovery finished.
    pub last_sequence: SequenceNumber,
}

impl<S> Recovered<S> {
    /// Sequence the next durable write will receive.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.last_sequence.next()
    }
}

/// Rebuild state from `snapshots` and `wal`.
///
/// Replay applies events with [`EventSourced::apply`], the same function
/// live commands use, so the result equals having applied every event live.
pub async fn recover<S>(
    wal: &dyn WalPort<S::Payload>,
    snapshots: &dyn SnapshotStore<S>,
) -> Result<Recovered<S>, RecoveryError>
where
    S: EventSourced,
{
    let (mut state, snapshot_sequence) = match snapshots.load_latest_snapshot().await? {
        Some(snapshot) => {
            let (state, sequence) = snapshot.into_parts();
            info!(%sequence, "restoring from snapshot");
            (state, Some(sequence))
        }
        None => {
            info!("no snapshot found, replaying full log");
            (S::default(), None)
        }
    };

    let replayed = {
        let mut apply = |entry: LogEntry<S::Payload>| state.apply(&entry.event);
        match snapshot_sequence {
            Some(sequence) => wal.replay_from(sequence, &mut apply).await?,
            None => wal.replay(&mut apply).await?,
        }
    };

    let last_sequence = wal.current_sequence().await;
    info!(replayed, %last_sequence, "recovery complete");

    Ok(Recovered {
        state,
        snapshot_sequence,
        replayed,
        last_sequence,
    })
}
