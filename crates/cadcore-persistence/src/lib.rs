//! File-backed ports for cadcore.
//!
//! - [`FileWal`] - append-only JSON-lines log, synced on every write
//! - [`FileSnapshotStore`] - one JSON file per snapshot, written atomically
//!
//! ```text
//! <wal dir>/events.wal
//!   {"type":"floor","sequence":41}
//!   {"type":"entry","sequence":42,"event":{...}}
//!   {"type":"batch","first":43,"events":[{...},{...}]}
//!
//! <snapshot dir>/snapshot-00000000000000000041.json
//! ```

mod atomic;
mod snapshots;
mod wal;

pub use snapshots::FileSnapshotStore;
pub use wal::{FileWal, FileWalConfig, SyncMode};
