use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::event::DomainEvent;
use crate::mutation::PendingMutation;

/// State rebuilt by folding events in log order.
///
/// `apply` is the only way state changes, both for live commands and for
/// replay. It must be deterministic: the same events in the same order
/// always yield the same state.
pub trait EventSourced: Default + Clone + Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;

    fn apply(&mut self, event: &DomainEvent<Self::Payload>);
}

/// Live state shared between command handlers, readers and checkpoints.
pub struct SharedState<S> {
    inner: Arc<RwLock<S>>,
}

impl<S> Clone for SharedState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EventSourced> SharedState<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Run `f` against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Clone of the current state.
    pub fn capture(&self) -> S {
        self.read(S::clone)
    }

    pub fn apply(&self, event: &DomainEvent<S::Payload>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.apply(event);
    }

    /// Pair `event` with applying it to this state, for use once it is durable.
    pub fn defer(&self, event: DomainEvent<S::Payload>) -> PendingMutation<S::Payload> {
        let state = self.clone();
        let applied = event.clone();
        PendingMutation::new(event, move || state.apply(&applied))
    }
}

impl<S: EventSourced> Default for SharedState<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: fmt::Debug> fmt::Debug for SharedState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_tuple("SharedState").field(&*guard).finish()
    }
}
