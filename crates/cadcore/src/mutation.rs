use std::fmt;

use crate::event::DomainEvent;

type ApplyFn = Box<dyn FnOnce() + Send>;

/// An event paired with the state change it causes, not yet applied.
///
/// Preparing a command yields one of these without touching shared state.
/// The pipeline writes the event first and only then calls [`commit`],
/// which consumes the value so the change can run at most once.
///
/// [`commit`]: PendingMutation::commit
#[must_use = "a pending mutation does nothing until committed"]
pub struct PendingMutation<P> {
    event: DomainEvent<P>,
    apply: ApplyFn,
}

impl<P> PendingMutation<P> {
    pub fn new(event: DomainEvent<P>, apply: impl FnOnce() + Send + 'static) -> Self {
        Self {
            event,
            apply: Box::new(apply),
        }
    }

    pub fn event(&self) -> &DomainEvent<P> {
        &self.event
    }

    /// Split into the event to write and the change to apply afterwards.
    pub fn into_parts(self) -> (DomainEvent<P>, Commit) {
        (self.event, Commit(self.apply))
    }
}

impl<P: fmt::Debug> fmt::Debug for PendingMutation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMutation")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// The deferred half of a [`PendingMutation`].
pub struct Commit(ApplyFn);

impl Commit {
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Commit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn apply_runs_only_when_committed() {
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let pending = PendingMutation::new(DomainEvent::system(&SystemClock, "x"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (event, commit) = pending.into_parts();
        assert_eq!(*event.payload(), "x");
        assert_eq!(applied.load(Ordering::SeqCst), 0);

        commit.run();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }
}
