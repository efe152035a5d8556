mod common;

use cadcore::{
    recover, CheckpointError, CheckpointPolicy, Checkpointer, DomainEvent, EntityLockManager,
    EventSourced, RecoveryError, SequenceNumber, SharedState, SnapshotStore, SystemClock, WalError,
    WalPort,
};
use cadcore_testing::{InMemorySnapshotStore, InMemoryWal, TruncationAudit};
use common::{Adjust, Adjusted, Tally, TallyHandler, TallyPipeline};
use std::sync::Arc;

fn random_adjust(rng: &mut fastrand::Rng) -> Adjust {
    let counter = ["a", "b", "c", "d"][rng.usize(..4)];
    Adjust::new(counter, rng.i64(-50..50))
}

// ============================================================================
// Snapshot + replay
// ============================================================================

#[tokio::test]
async fn empty_ports_recover_default_state() {
    let wal = InMemoryWal::<Adjusted>::new();
    let snapshots = InMemorySnapshotStore::<Tally>::new();

    let recovered = recover::<Tally>(&wal, &snapshots).await.unwrap();

    assert_eq!(recovered.state, Tally::default());
    assert_eq!(recovered.snapshot_sequence, None);
    assert_eq!(recovered.replayed, 0);
    assert_eq!(recovered.next_sequence(), SequenceNumber::start().next());
}

#[tokio::test]
async fn snapshot_plus_tail_equals_live_state() {
    for seed in 0..20u64 {
        let mut rng = fastrand::Rng::with_seed(seed);
        let total = rng.usize(1..60);
        let snapshot_at = rng.usize(0..total);

        let wal = Arc::new(InMemoryWal::<Adjusted>::new());
        let snapshots = InMemorySnapshotStore::<Tally>::new();
        let pipeline = TallyPipeline::new(EntityLockManager::new(), wal.clone());
        let state = SharedState::<Tally>::default();
        let handler = TallyHandler::new(state.clone());

        for handled in 0..total {
            if handled == snapshot_at {
                let sequence = wal.current_sequence().await;
                snapshots.create_snapshot(&state.capture(), sequence).await.unwrap();
            }
            pipeline.handle(&handler, random_adjust(&mut rng)).await.unwrap();
        }

        let recovered = recover::<Tally>(wal.as_ref(), &snapshots).await.unwrap();
        assert_eq!(recovered.state, state.capture(), "seed {seed}");
        assert_eq!(recovered.replayed, total - snapshot_at, "seed {seed}");
        assert_eq!(recovered.last_sequence, wal.current_sequence().await);

        let replay_only = recover::<Tally>(wal.as_ref(), &InMemorySnapshotStore::<Tally>::new())
            .await
            .unwrap();
        assert_eq!(replay_only.state, state.capture(), "seed {seed}");
    }
}

#[tokio::test]
async fn replay_starts_strictly_after_the_snapshot() {
    let wal = InMemoryWal::<Adjusted>::new();
    let snapshots = InMemorySnapshotStore::<Tally>::new();
    let mut live = Tally::default();

    for delta in [1, 2, 3] {
        let event = DomainEvent::system(
            &SystemClock,
            Adjusted {
                counter: "a".into(),
                delta,
            },
        );
        let sequence = wal.write(&event).await.unwrap();
        live.apply(&event);
        if delta == 2 {
            snapshots.create_snapshot(&live, sequence).await.unwrap();
        }
    }

    let recovered = recover::<Tally>(&wal, &snapshots).await.unwrap();
    assert_eq!(recovered.replayed, 1);
    assert_eq!(recovered.state.counters["a"], 6);
    assert_eq!(recovered.state.applied, 3);
}

#[tokio::test]
async fn unreadable_log_fails_recovery() {
    let wal = InMemoryWal::<Adjusted>::new();
    let event = DomainEvent::system(
        &SystemClock,
        Adjusted {
            counter: "a".into(),
            delta: 1,
        },
    );
    let first = wal.write(&event).await.unwrap();
    wal.write(&event).await.unwrap();
    wal.truncate(first).await.unwrap();

    // No snapshot covers the truncated entry.
    let err = recover::<Tally>(&wal, &InMemorySnapshotStore::<Tally>::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RecoveryError::Replay(WalError::Truncated { .. })
    ));
}

// ============================================================================
// Checkpointing
// ============================================================================

struct Harness {
    wal: Arc<InMemoryWal<Adjusted>>,
    snapshots: Arc<InMemorySnapshotStore<Tally>>,
    audit: TruncationAudit,
    pipeline: TallyPipeline,
    state: SharedState<Tally>,
    handler: TallyHandler,
    checkpointer: Checkpointer<Tally>,
}

fn harness(policy: CheckpointPolicy) -> Harness {
    let wal = Arc::new(InMemoryWal::<Adjusted>::new());
    let snapshots = Arc::new(InMemorySnapshotStore::<Tally>::new());
    let audit = TruncationAudit::new();
    let audited_wal: Arc<dyn WalPort<Adjusted>> = Arc::new(audit.wal::<Adjusted>(wal.clone()));
    let audited_snapshots: Arc<dyn SnapshotStore<Tally>> =
        Arc::new(audit.snapshots::<Tally>(snapshots.clone()));

    let pipeline = TallyPipeline::new(EntityLockManager::new(), audited_wal);
    let state = SharedState::<Tally>::default();
    let handler = TallyHandler::new(state.clone());
    let checkpointer =
        Checkpointer::new(pipeline.clone(), audited_snapshots, state.clone()).with_policy(policy);

    Harness {
        wal,
        snapshots,
        audit,
        pipeline,
        state,
        handler,
        checkpointer,
    }
}

#[tokio::test]
async fn checkpoints_never_truncate_past_a_snapshot() {
    let h = harness(CheckpointPolicy {
        min_events_between: 5,
        keep_snapshots: 2,
    });
    let mut rng = fastrand::Rng::with_seed(7);

    for _ in 0..40 {
        h.pipeline
            .handle(&h.handler, random_adjust(&mut rng))
            .await
            .unwrap();
        h.checkpointer.checkpoint_if_due().await.unwrap();
    }

    h.audit.assert_clean();
    assert!(!h.audit.truncations().is_empty());
    assert!(h.snapshots.sequences().await.len() <= 2);

    let recovered = recover::<Tally>(h.wal.as_ref(), h.snapshots.as_ref())
        .await
        .unwrap();
    assert_eq!(recovered.state, h.state.capture());
}

#[tokio::test]
async fn older_retained_snapshot_still_recovers() {
    let h = harness(CheckpointPolicy {
        min_events_between: 1,
        keep_snapshots: 2,
    });

    h.pipeline.handle(&h.handler, Adjust::new("a", 1)).await.unwrap();
    let older = h.checkpointer.checkpoint().await.unwrap();
    h.pipeline.handle(&h.handler, Adjust::new("a", 2)).await.unwrap();
    let newer = h.checkpointer.checkpoint().await.unwrap();
    h.pipeline.handle(&h.handler, Adjust::new("a", 3)).await.unwrap();

    assert_eq!(newer.truncated_through, older.sequence);
    assert_eq!(
        h.snapshots.sequences().await,
        vec![older.sequence, newer.sequence]
    );

    // Lose the newest snapshot: the older one plus the log must still suffice.
    let fallback = InMemorySnapshotStore::<Tally>::new();
    let older_state = Tally {
        counters: [("a".to_string(), 1)].into_iter().collect(),
        applied: 1,
    };
    fallback.create_snapshot(&older_state, older.sequence).await.unwrap();

    let recovered = recover::<Tally>(h.wal.as_ref(), &fallback).await.unwrap();
    assert_eq!(recovered.state, h.state.capture());
    assert_eq!(recovered.replayed, 2);
}

#[tokio::test]
async fn checkpoint_is_skipped_until_due() {
    let h = harness(CheckpointPolicy {
        min_events_between: 3,
        keep_snapshots: 1,
    });

    for _ in 0..2 {
        h.pipeline.handle(&h.handler, Adjust::new("a", 1)).await.unwrap();
        assert!(h.checkpointer.checkpoint_if_due().await.unwrap().is_none());
    }
    h.pipeline.handle(&h.handler, Adjust::new("a", 1)).await.unwrap();
    let report = h.checkpointer.checkpoint_if_due().await.unwrap().unwrap();

    assert_eq!(report.sequence, h.wal.current_sequence().await);
    assert_eq!(report.truncated_through, report.sequence);
    assert!(h.wal.is_empty().await);
    h.audit.assert_clean();
}

#[tokio::test]
async fn failed_snapshot_leaves_the_log_intact() {
    let h = harness(CheckpointPolicy::default());
    h.pipeline.handle(&h.handler, Adjust::new("a", 1)).await.unwrap();
    h.snapshots.fail_writes(true);

    let err = h.checkpointer.checkpoint().await.unwrap_err();

    assert!(matches!(err, CheckpointError::Snapshot(_)));
    assert_eq!(h.wal.len().await, 1);
    assert!(h.audit.truncations().is_empty());

    // Live processing continues.
    h.pipeline.handle(&h.handler, Adjust::new("a", 1)).await.unwrap();
    assert_eq!(h.wal.len().await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_during_traffic_recovers_exactly() {
    let h = Arc::new(harness(CheckpointPolicy {
        min_events_between: 1,
        keep_snapshots: 2,
    }));

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let h = h.clone();
            tokio::spawn(async move {
                let mut rng = fastrand::Rng::with_seed(w);
                for _ in 0..25 {
                    h.pipeline
                        .handle(&h.handler, random_adjust(&mut rng))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    let checkpoints = {
        let h = h.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                h.checkpointer.checkpoint().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    checkpoints.await.unwrap();

    h.audit.assert_clean();
    assert_eq!(h.state.capture().applied, 100);
    let recovered = recover::<Tally>(h.wal.as_ref(), h.snapshots.as_ref())
        .await
        .unwrap();
    assert_eq!(recovered.state, h.state.capture());
}
