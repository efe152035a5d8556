//! # cadcore
//!
//! Command-processing durability core for a computer-aided dispatch backend.
//!
//! ## Core Concepts
//!
//! cadcore separates **intent** from **facts**:
//! - [`Command`] = Intent (a request to change incidents, calls or units)
//! - [`DomainEvent`] = Facts (what was decided, durable once written)
//!
//! The key principle: **log before state**. No change to operational state
//! is visible until the event that causes it is durable in the log.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ handle(command)
//!   ▼
//! CommandPipeline
//!   │
//!   ├─► handler.determine_lock_scope() ─► LockScope [incident:I-7, unit:M12]
//!   │
//!   ├─► EntityLockManager.acquire()      (sorted order, reentrant per task)
//!   │
//!   ├─► handler.prepare_execution() ──► PendingMutation { event, commit }
//!   │                                      │
//!   ├─► WalPort.write(event) ◄─────────────┘   blocks until durable
//!   │
//!   ├─► commit.run()                     (state changes here, exactly once)
//!   │
//!   └─► handler.build_result() ─► release locks ─► result
//!
//! process start:
//!   SnapshotStore.load_latest_snapshot() ─► WalPort.replay_from(snapshot) ─► state
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Log before state** - a mutation runs only after its event is durable
//! 2. **Nothing half-done** - a rejected or undurable command leaves state untouched
//! 3. **Sorted locking** - scope keys are taken in one global order, so no deadlock
//! 4. **Per-aggregate order** - commands sharing a key run one after another
//! 5. **Deterministic replay** - live commands and recovery share one `apply`
//! 6. **Safe truncation** - the log is never truncated past a durable snapshot
//!
//! ## Example
//!
//! ```ignore
//! use cadcore::dispatch::{DispatchCommand, DispatchHandler, OperationalState, UnitStatus};
//! use cadcore::{recover, CommandPipeline, EntityLockManager, SharedState, SystemClock};
//! use std::sync::Arc;
//!
//! let recovered = recover::<OperationalState>(wal.as_ref(), snapshots.as_ref()).await?;
//! let state = SharedState::new(recovered.state);
//!
//! let pipeline = CommandPipeline::new(EntityLockManager::new(), wal.clone());
//! let handler = DispatchHandler::new(state.clone(), Arc::new(SystemClock));
//!
//! pipeline
//!     .handle(&handler, DispatchCommand::open_incident("I-7", "structure fire", 1))
//!     .await?;
//! pipeline
//!     .handle(&handler, DispatchCommand::assign_unit("M12", "I-7"))
//!     .await?;
//! ```
//!
//! ## What This Is Not
//!
//! cadcore does not serve queries, replicate across processes, or
//! deduplicate resubmitted commands. [`CommandId`] travels with every event
//! so the layer above can.

mod checkpoint;
mod clock;
mod error;
mod event;
mod handler;
mod ids;
mod lock;
mod mutation;
mod recovery;
mod sequence;
mod snapshot;
mod state;
mod wal;

// CAD operational domain
pub mod dispatch;

// Re-export identifiers and positions
pub use ids::{CommandId, EventId};
pub use sequence::SequenceNumber;

// Re-export facts and intents
pub use event::{Command, DomainEvent};
pub use mutation::{Commit, PendingMutation};

// Re-export error types
pub use error::{
    CheckpointError, CommandError, LockError, RecoveryError, ScopeError, SequenceError,
    SnapshotReadError, SnapshotWriteError, ValidationError, WalError,
};

// Re-export locking types
pub use lock::{EntityLockManager, LockHandle, LockKey, LockScope};

// Re-export pipeline types
pub use handler::{CommandHandler, CommandPipeline, Quiesced};

// Re-export port contracts
pub use clock::{Clock, SystemClock};
pub use snapshot::{Snapshot, SnapshotStore};
pub use wal::{LogEntry, ReplayConsumer, WalPort};

// Re-export state and recovery types
pub use checkpoint::{CheckpointPolicy, CheckpointReport, Checkpointer};
pub use recovery::{recover, Recovered};
pub use state::{EventSourced, SharedState};

// Re-export commonly used external types
pub use async_trait::async_trait;
