//! Contract for the durable log.
//!
//! The core treats the log as an opaque, internally serialized port. Any
//! implementation must uphold:
//!
//! 1. `write` / `write_batch` return only after the entries are durable.
//! 2. A batch is all-or-nothing: a partial batch is never visible after
//!    recovery.
//! 3. Replay delivers durable entries once each, in ascending sequence order.
//! 4. The empty log reports [`SequenceNumber::start`]; the first entry is
//!    `start().next()`.
//! 5. `truncate(up_to)` discards entries `<= up_to` and keeps reporting the
//!    highest sequence ever assigned.
//!
//! Callers must never truncate past the newest durable snapshot; see
//! [`Checkpointer`](crate::Checkpointer).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WalError;
use crate::event::DomainEvent;
use crate::sequence::SequenceNumber;

/// One durable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<P> {
    pub sequence: SequenceNumber,
    pub event: DomainEvent<P>,
}

/// Receives replayed entries.
pub type ReplayConsumer<'a, P> = dyn FnMut(LogEntry<P>) + Send + 'a;

#[async_trait]
pub trait WalPort<P: Send + Sync + 'static>: Send + Sync {
    /// Append one event; returns its sequence once durable.
    async fn write(&self, event: &DomainEvent<P>) -> Result<SequenceNumber, WalError>;

    /// Append `events` atomically; returns the sequence of the last one.
    ///
    /// An empty batch writes nothing and returns the current sequence.
    async fn write_batch(&self, events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError>;

    /// Deliver every entry strictly after `from`, in order. Returns how many
    /// entries were delivered.
    async fn replay_from(
        &self,
        from: SequenceNumber,
        consumer: &mut ReplayConsumer<'_, P>,
    ) -> Result<usize, WalError>;

    /// Deliver every retained entry, in order.
    async fn replay(&self, consumer: &mut ReplayConsumer<'_, P>) -> Result<usize, WalError> {
        self.replay_from(SequenceNumber::start(), consumer).await
    }

    /// Permanently discard entries at or before `up_to`.
    async fn truncate(&self, up_to: SequenceNumber) -> Result<(), WalError>;

    /// Highest sequence ever assigned, or `start()` for an empty log.
    async fn current_sequence(&self) -> SequenceNumber;
}
