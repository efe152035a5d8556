//! Log doubles.

use async_trait::async_trait;
use cadcore::{DomainEvent, LogEntry, ReplayConsumer, SequenceNumber, WalError, WalPort};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};

struct Log<P> {
    entries: Vec<LogEntry<P>>,
    last: SequenceNumber,
    /// Entries at or before this have been truncated.
    floor: SequenceNumber,
}

/// A log held in memory. "Durable" as soon as `write` returns.
pub struct InMemoryWal<P> {
    log: Mutex<Log<P>>,
}

impl<P: Clone + Send + Sync + 'static> InMemoryWal<P> {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Log {
                entries: Vec::new(),
                last: SequenceNumber::start(),
                floor: SequenceNumber::start(),
            }),
        }
    }

    /// Copy of every retained entry, in order.
    pub async fn entries(&self) -> Vec<LogEntry<P>> {
        self.log.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<P: Clone + Send + Sync + 'static> Default for InMemoryWal<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> WalPort<P> for InMemoryWal<P> {
    async fn write(&self, event: &DomainEvent<P>) -> Result<SequenceNumber, WalError> {
        let mut log = self.log.lock().await;
        let sequence = log.last.checked_next()?;
        log.entries.push(LogEntry {
            sequence,
            event: event.clone(),
        });
        log.last = sequence;
        Ok(sequence)
    }

    async fn write_batch(&self, events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError> {
        let mut log = self.log.lock().await;
        log.last.checked_advance(events.len() as u64)?;
        for event in events {
            let sequence = log.last.next();
            log.entries.push(LogEntry {
                sequence,
                event: event.clone(),
            });
            log.last = sequence;
        }
        Ok(log.last)
    }

    async fn replay_from(
        &self,
        from: SequenceNumber,
        consumer: &mut ReplayConsumer<'_, P>,
    ) -> Result<usize, WalError> {
        let entries: Vec<LogEntry<P>> = {
            let log = self.log.lock().await;
            if from.is_before(log.floor) {
                return Err(WalError::Truncated {
                    requested: from,
                    floor: log.floor,
                });
            }
            log.entries
                .iter()
                .filter(|entry| entry.sequence.is_after(from))
                .cloned()
                .collect()
        };
        let count = entries.len();
        for entry in entries {
            consumer(entry);
        }
        Ok(count)
    }

    async fn truncate(&self, up_to: SequenceNumber) -> Result<(), WalError> {
        let mut log = self.log.lock().await;
        let up_to = up_to.min(log.last);
        log.entries.retain(|entry| entry.sequence.is_after(up_to));
        if up_to.is_after(log.floor) {
            log.floor = up_to;
        }
        Ok(())
    }

    async fn current_sequence(&self) -> SequenceNumber {
        self.log.lock().await.last
    }
}

/// A log whose writes always fail. Counts attempts.
pub struct FailingWal {
    attempts: AtomicUsize,
    reason: String,
}

impl FailingWal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            reason: reason.into(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> WalPort<P> for FailingWal {
    async fn write(&self, _event: &DomainEvent<P>) -> Result<SequenceNumber, WalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WalError::rejected(self.reason.clone()))
    }

    async fn write_batch(&self, _events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WalError::rejected(self.reason.clone()))
    }

    async fn replay_from(
        &self,
        _from: SequenceNumber,
        _consumer: &mut ReplayConsumer<'_, P>,
    ) -> Result<usize, WalError> {
        Ok(0)
    }

    async fn truncate(&self, _up_to: SequenceNumber) -> Result<(), WalError> {
        Ok(())
    }

    async fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber::start()
    }
}

/// Wraps a log and holds every write until the test opens the gate.
///
/// Lets a test observe the window between "write requested" and "write
/// durable".
pub struct GatedWal<P> {
    inner: Arc<dyn WalPort<P>>,
    started: Notify,
    gate: Semaphore,
}

impl<P: Send + Sync + 'static> GatedWal<P> {
    pub fn new(inner: Arc<dyn WalPort<P>>) -> Self {
        Self {
            inner,
            started: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Wait until a write has started and is blocked at the gate.
    pub async fn write_started(&self) {
        self.started.notified().await
    }

    /// Let `writes` held or future writes through.
    pub fn open(&self, writes: usize) {
        self.gate.add_permits(writes);
    }

    async fn pass_gate(&self) -> Result<(), WalError> {
        self.started.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| WalError::rejected("gate closed"))?;
        permit.forget();
        Ok(())
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> WalPort<P> for GatedWal<P> {
    async fn write(&self, event: &DomainEvent<P>) -> Result<SequenceNumber, WalError> {
        self.pass_gate().await?;
        self.inner.write(event).await
    }

    async fn write_batch(&self, events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError> {
        self.pass_gate().await?;
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
        self.inner.truncate(up_to).await
    }

    async fn current_sequence(&self) -> SequenceNumber {
        self.inner.current_sequence().await
    }
}

type WriteHook<P> = Arc<dyn Fn(&DomainEvent<P>) + Send + Sync>;

/// Wraps a log and calls a hook as each write starts and once it is durable.
pub struct HookedWal<P> {
    inner: Arc<dyn WalPort<P>>,
    before: WriteHook<P>,
    after: WriteHook<P>,
}

impl<P: Send + Sync + 'static> HookedWal<P> {
    pub fn new(
        inner: Arc<dyn WalPort<P>>,
        before: impl Fn(&DomainEvent<P>) + Send + Sync + 'static,
        after: impl Fn(&DomainEvent<P>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            before: Arc::new(before),
            after: Arc::new(after),
        }
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> WalPort<P> for HookedWal<P> {
    async fn write(&self, event: &DomainEvent<P>) -> Result<SequenceNumber, WalError> {
        (self.before)(event);
        // Yield so any other runnable task gets a chance to interleave here.
        tokio::task::yield_now().await;
        let sequence = self.inner.write(event).await?;
        (self.after)(event);
        Ok(sequence)
    }

    async fn write_batch(&self, events: &[DomainEvent<P>]) -> Result<SequenceNumber, WalError> {
        events.iter().for_each(|event| (self.before)(event));
        let sequence = self.inner.write_batch(events).await?;
        events.iter().for_each(|event| (self.after)(event));
        Ok(sequence)
    }

    async fn replay_from(
        &self,
        from: SequenceNumber,
        consumer: &mut ReplayConsumer<'_, P>,
    ) -> Result<usize, WalError> {
        self.inner.replay_from(from, consumer).await
    }

    async fn truncate(&self, up_to: SequenceNumber) -> Result<(), WalError> {
        self.inner.truncate(up_to).await
    }

    async fn current_sequence(&self) -> SequenceNumber {
        self.inner.current_sequence().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadcore::SystemClock;

    fn event(n: u32) -> DomainEvent<u32> {
        DomainEvent::system(&SystemClock, n)
    }

    async fn replayed(wal: &InMemoryWal<u32>, from: SequenceNumber) -> Result<Vec<u32>, WalError> {
        let mut seen = Vec::new();
        wal.replay_from(from, &mut |entry: LogEntry<u32>| seen.push(*entry.event.payload()))
            .await?;
        Ok(seen)
    }

    #[tokio::test]
    async fn first_entry_follows_the_start_position() {
        let wal = InMemoryWal::<u32>::new();
        assert_eq!(wal.current_sequence().await, SequenceNumber::start());

        let seq = wal.write(&event(1)).await.unwrap();
        assert_eq!(seq, SequenceNumber::start().next());
        assert_eq!(wal.current_sequence().await, seq);
    }

    #[tokio::test]
    async fn batch_returns_last_sequence_and_replays_in_order() {
        let wal = InMemoryWal::<u32>::new();
        wal.write(&event(1)).await.unwrap();
        let last = wal
            .write_batch(&[event(2), event(3), event(4)])
            .await
            .unwrap();
        assert_eq!(last.value(), 5);

        assert_eq!(replayed(&wal, SequenceNumber::start()).await.unwrap(), vec![1, 2, 3, 4]);
        let third = SequenceNumber::new(3).unwrap();
        assert_eq!(replayed(&wal, third).await.unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn truncate_keeps_high_water_mark() {
        let wal = InMemoryWal::<u32>::new();
        let last = wal.write_batch(&[event(1), event(2)]).await.unwrap();
        wal.truncate(last).await.unwrap();

        assert!(wal.is_empty().await);
        assert_eq!(wal.current_sequence().await, last);
        assert_eq!(wal.write(&event(3)).await.unwrap(), last.next());
    }

    #[tokio::test]
    async fn replay_before_truncation_point_is_refused() {
        let wal = InMemoryWal::<u32>::new();
        wal.write_batch(&[event(1), event(2), event(3)]).await.unwrap();
        wal.truncate(SequenceNumber::new(3).unwrap()).await.unwrap();

        let err = replayed(&wal, SequenceNumber::start()).await.unwrap_err();
        assert!(matches!(err, WalError::Truncated { .. }));
    }

    #[tokio::test]
    async fn gated_writes_wait_for_open() {
        let gated = Arc::new(GatedWal::new(Arc::new(InMemoryWal::<u32>::new())));
        let writer = {
            let gated = gated.clone();
            tokio::spawn(async move { gated.write(&event(1)).await })
        };

        gated.write_started().await;
        assert_eq!(gated.current_sequence().await, SequenceNumber::start());

        gated.open(1);
        let seq = writer.await.unwrap().unwrap();
        assert_eq!(gated.current_sequence().await, seq);
    }
}
