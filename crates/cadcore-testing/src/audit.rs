//! Watches a log and a snapshot store together and refuses any truncation
//! past the newest snapshot the store has made durable.

use async_trait::async_trait;
use cadcore::{
    DomainEvent, ReplayConsumer, SequenceNumber, Snapshot, SnapshotReadError, SnapshotStore,
    SnapshotWriteError, WalError, WalPort,
};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct AuditLog {
    latest_snapshot: Option<SequenceNumber>,
    truncations: Vec<SequenceNumber>,
    violations: Vec<String>,
}

/// Shared record of snapshots written and truncations requested.
#[derive(Debug, Clone, Default)]
pub struct TruncationAudit {
    log: Arc<Mutex<AuditLog>>,
}

impl TruncationAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `wal` so its truncations are checked against this audit.
    pub fn wal<P: Send + Sync + 'static>(&self, wal: Arc<dyn WalPort<P>>) -> AuditedWal<P> {
        AuditedWal {
            inner: wal,
            audit: self.clone(),
        }
    }

    /// Wrap `store` so its durable snapshots are recorded in this audit.
    pub fn snapshots<S: Send + Sync + 'static>(
        &self,
        store: Arc<dyn SnapshotStore<S>>,
    ) -> AuditedSnapshots<S> {
        AuditedSnapshots {
            inner: store,
            audit: self.clone(),
        }
    }

    pub fn truncations(&self) -> Vec<SequenceNumber> {
        self.with(|log| log.truncations.clone())
    }

    pub fn violations(&self) -> Vec<String> {
        self.with(|log| log.violations.clone())
    }

    /// Panics if any truncation was refused.
    pub fn assert_clean(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "unsafe truncations: {violations:?}");
    }

    fn with<R>(&self, f: impl FnOnce(&mut AuditLog) -> R) -> R {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut log)
    }
}

pub struct AuditedWal<P> {
    inner: Arc<dyn WalPort<P>>,
    audit: TruncationAudit,
}

#[async_trait]
impl<P: Send + Sync + 'static> WalPort<P> for AuditedWal<P> {
    async fn write(&self, event: &DomainEvent<P>) -> Result<SequenceNumber, WalError> {
        self.inner.write(event).await
    }

    async fn write_batch(&self, events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError> {
        self.inner.write_batch(events).await
    }

    async fn replay_from(
        &self,
        from: SequenceNumber,
        consumer: &mut ReplayConsumer<'_, P>,
    ) -> Result<usize, WalError> {
        self.inner.replay_from(from, consumer).await
    }

    async fn truncate(&self, up_to: SequenceNumber) -> Result<(), WalError> {
        let refused = self.audit.with(|log| {
            let safe = log
                .latest_snapshot
                .is_some_and(|snapshot| !up_to.is_after(snapshot));
            if safe {
                log.truncations.push(up_to);
                None
            } else {
                log.violations.push(format!(
                    "truncate through {up_to} with latest snapshot {:?}",
                    log.latest_snapshot
                ));
                Some(log.latest_snapshot)
            }
        });
        if let Some(snapshot) = refused {
            return Err(WalError::TruncateBeyondSnapshot {
                requested: up_to,
                snapshot,
            });
        }
        self.inner.truncate(up_to).await
    }

    async fn current_sequence(&self) -> SequenceNumber {
        self.inner.current_sequence().await
    }
}

pub struct AuditedSnapshots<S> {
    inner: Arc<dyn SnapshotStore<S>>,
    audit: TruncationAudit,
}

#[async_trait]
impl<S: Send + Sync + 'static> SnapshotStore<S> for AuditedSnapshots<S> {
    async fn create_snapshot(
        &self,
        state: &S,
        up_to: SequenceNumber,
    ) -> Result<(), SnapshotWriteError> {
        self.inner.create_snapshot(state, up_to).await?;
        self.audit.with(|log| {
            log.latest_snapshot = Some(log.latest_snapshot.map_or(up_to, |seen| seen.max(up_to)));
        });
        Ok(())
    }

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot<S>>, SnapshotReadError> {
        self.inner.load_latest_snapshot().await
    }

    async fn purge_older_snapshots(
        &self,
        keep_after: SequenceNumber,
    ) -> Result<usize, SnapshotWriteError> {
        self.inner.purge_older_snapshots(keep_after).await
    }
}
