use async_trait::async_trait;
use cadcore::{SequenceNumber, Snapshot, SnapshotReadError, SnapshotStore, SnapshotWriteError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Snapshots held in memory, keyed by sequence.
pub struct InMemorySnapshotStore<S> {
    snapshots: Mutex<BTreeMap<SequenceNumber, S>>,
    fail_writes: AtomicBool,
}

impl<S: Clone + Send + Sync + 'static> InMemorySnapshotStore<S> {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following `create_snapshot` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Sequences of stored snapshots, oldest first.
    pub async fn sequences(&self) -> Vec<SequenceNumber> {
        self.snapshots.lock().await.keys().copied().collect()
    }
}

impl<S: Clone + Send + Sync + 'static> Default for InMemorySnapshotStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> SnapshotStore<S> for InMemorySnapshotStore<S> {
    async fn create_snapshot(
        &self,
        state: &S,
        up_to: SequenceNumber,
    ) -> Result<(), SnapshotWriteError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SnapshotWriteError::Rejected {
                reason: "snapshot writes disabled".into(),
            });
        }
        self.snapshots.lock().await.insert(up_to, state.clone());
        Ok(())
    }

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot<S>>, SnapshotReadError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .iter()
            .next_back()
            .map(|(sequence, state)| Snapshot::new(state.clone(), *sequence)))
    }

    async fn purge_older_snapshots(
        &self,
        keep_after: SequenceNumber,
    ) -> Result<usize, SnapshotWriteError> {
        let mut snapshots = self.snapshots.lock().await;
        let before = snapshots.len();
        snapshots.retain(|sequence, _| !sequence.is_before(keep_after));
        Ok(before - snapshots.len())
    }
}
