//! The command pipeline.
//!
//! Every command runs the same fixed sequence. Handlers supply the three
//! domain-specific steps; the pipeline owns the ordering.
//!
//! ```text
//! determine_lock_scope ─► acquire ─► prepare_execution ─► wal.write ─► commit ─► build_result
//!                           │              │                  │
//!                           └── error ─────┴──── error ───────┴──► release locks ─► Err
//! ```
//!
//! A mutation is applied only after its event is durable. If preparation or
//! the write fails, the mutation is dropped unapplied and state is unchanged.
//! A caller that gives up on [`CommandPipeline::handle`] after preparation
//! does not stop the write; if it lands, the mutation is applied anyway.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{CommandError, ValidationError};
use crate::event::{Command, DomainEvent};
use crate::lock::{EntityLockManager, LockScope};
use crate::mutation::PendingMutation;
use crate::sequence::SequenceNumber;
use crate::wal::WalPort;

/// The domain-specific steps of handling one kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    type Command: Command;
    type Payload: Send + Sync + 'static;
    type Output: Send;

    /// Aggregates the command touches. Pure; must not fail.
    fn determine_lock_scope(&self, command: &Self::Command) -> LockScope;

    /// Validate the command and compute its event and deferred mutation.
    ///
    /// Runs with the scope's locks held. Must not change shared state.
    async fn prepare_execution(
        &self,
        command: &Self::Command,
    ) -> Result<PendingMutation<Self::Payload>, ValidationError>;

    /// Result returned to the caller once the event is durable and applied.
    fn build_result(
        &self,
        command: &Self::Command,
        event: &DomainEvent<Self::Payload>,
        sequence: SequenceNumber,
    ) -> Self::Output;
}

/// Held while no command sits between its durable write and its apply.
pub type Quiesced = OwnedRwLockWriteGuard<()>;

/// Runs commands through lock, prepare, write, apply.
pub struct CommandPipeline<P: Send + Sync + 'static> {
    locks: EntityLockManager,
    wal: Arc<dyn WalPort<P>>,
    /// Shared by every write-then-apply section; taken exclusively by `quiesce`.
    apply_gate: Arc<RwLock<()>>,
    lock_timeout: Option<Duration>,
}

impl<P: Send + Sync + 'static> Clone for CommandPipeline<P> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
            wal: self.wal.clone(),
            apply_gate: self.apply_gate.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<P: Send + Sync + 'static> CommandPipeline<P> {
    pub fn new(locks: EntityLockManager, wal: Arc<dyn WalPort<P>>) -> Self {
        Self {
            locks,
            wal,
            apply_gate: Arc::new(RwLock::new(())),
            lock_timeout: None,
        }
    }

    /// Fail with [`CommandError::LockAcquisition`] instead of waiting longer
    /// than `after` for a scope. Without this, lock waits are unbounded.
    pub fn with_lock_timeout(mut self, after: Duration) -> Self {
        self.lock_timeout = Some(after);
        self
    }

    pub fn locks(&self) -> &EntityLockManager {
        &self.locks
    }

    pub fn wal(&self) -> &Arc<dyn WalPort<P>> {
        &self.wal
    }

    /// Handle one command.
    ///
    /// Locks are released on every exit path before this returns. Once
    /// preparation succeeds, the write and the apply run on their own task
    /// that owns the locks, so dropping this future cannot leave a durable
    /// event unapplied.
    pub async fn handle<H>(
        &self,
        handler: &H,
        command: H::Command,
    ) -> Result<H::Output, CommandError>
    where
        H: CommandHandler<Payload = P> + ?Sized,
    {
        let command_id = command.command_id();
        let scope = handler.determine_lock_scope(&command);

        let mut locks = match self.lock_timeout {
            Some(after) => self.locks.acquire_timeout(&scope, after).await.map_err(|err| {
                warn!(%command_id, error = %err, "command could not lock its scope");
                err
            })?,
            None => self.locks.acquire(&scope).await,
        };
        debug!(%command_id, keys = scope.len(), "command locked");

        let prepared = locks.hold(handler.prepare_execution(&command)).await;
        let pending = match prepared {
            Ok(pending) => pending,
            Err(err) => {
                locks.release();
                warn!(%command_id, error = %err, "command rejected");
                return Err(err.into());
            }
        };
        let (event, commit) = pending.into_parts();
        debug!(%command_id, event_id = %event.event_id(), "command prepared");

        let wal = self.wal.clone();
        let gate = self.apply_gate.clone();
        let durable = tokio::spawn(async move {
            let _gate = gate.read_owned().await;
            let written = wal.write(&event).await;
            if let Ok(sequence) = &written {
                debug!(%command_id, %sequence, "event durable");
                commit.run();
            }
            locks.release();
            written.map(|sequence| (event, sequence))
        });

        let (event, sequence) = match durable.await {
            Ok(written) => written.map_err(|err| {
                warn!(%command_id, error = %err, "event not durable, mutation discarded");
                err
            })?,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => return Err(CommandError::Interrupted),
        };
        debug!(%command_id, %sequence, "mutation applied");

        Ok(handler.build_result(&command, &event, sequence))
    }

    /// Wait until every in-flight write has been applied, then hold off new
    /// writes until the guard is dropped.
    ///
    /// Commands still prepare concurrently; they wait only at their write.
    pub async fn quiesce(&self) -> Quiesced {
        self.apply_gate.clone().write_owned().await
    }
}

impl<P: Send + Sync + 'static> fmt::Debug for CommandPipeline<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("locks", &self.locks)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
