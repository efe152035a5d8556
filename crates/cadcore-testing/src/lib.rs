//! Test doubles for cadcore's ports.
//!
//! - [`InMemoryWal`] / [`InMemorySnapshotStore`] - fast, non-persistent ports
//! - [`FailingWal`] - every write fails
//! - [`GatedWal`] - writes block until the test opens a gate
//! - [`HookedWal`] - observe each write as it starts and once it is durable
//! - [`TruncationAudit`] - refuses log truncation past the newest snapshot
//! - [`ManualClock`] - deterministic timestamps

mod audit;
mod clock;
mod snapshots;
mod wal;

pub use audit::{AuditedSnapshots, AuditedWal, TruncationAudit};
pub use clock::ManualClock;
pub use snapshots::InMemorySnapshotStore;
pub use wal::{FailingWal, GatedWal, HookedWal, InMemoryWal};
