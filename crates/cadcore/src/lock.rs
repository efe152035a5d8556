//! Per-aggregate locking.
//!
//! Every command names the aggregates it touches as a [`LockScope`]. The
//! [`EntityLockManager`] takes one mutex per [`LockKey`], always in ascending
//! key order. Two scopes that share keys therefore converge on the same
//! acquisition order no matter how their callers listed them, so no
//! wait-for cycle can form.
//!
//! ```text
//! scope [unit:M12, incident:I-7]  ──sort──►  incident:I-7 → unit:M12
//! scope [incident:I-7, unit:M12]  ──sort──►  incident:I-7 → unit:M12
//! ```
//!
//! Locks are reentrant per task: code running inside [`LockHandle::hold`]
//! re-acquires keys the enclosing handle already owns without waiting.
//!
//! Registry entries are created on first use and evicted once no task holds
//! or waits on them, so the registry stays proportional to the number of
//! aggregates in flight rather than every aggregate ever seen.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{LockError, ScopeError};

tokio::task_local! {
    static HELD_KEYS: Arc<BTreeSet<LockKey>>;
}

/// Identifies one lockable aggregate, e.g. `("unit", "M12")`.
///
/// Ordered by kind, then id. The order depends only on the strings, so it is
/// identical across processes and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    kind: String,
    id: String,
}

impl LockKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// The set of aggregates one command holds exclusively.
///
/// Never empty. Keys are kept sorted and de-duplicated, so listing a key
/// twice is harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockScope {
    keys: SmallVec<[LockKey; 4]>,
}

impl LockScope {
    pub fn new(keys: impl IntoIterator<Item = LockKey>) -> Result<Self, ScopeError> {
        let mut keys: SmallVec<[LockKey; 4]> = keys.into_iter().collect();
        if keys.is_empty() {
            return Err(ScopeError::Empty);
        }
        keys.sort();
        keys.dedup();
        Ok(Self { keys })
    }

    pub fn single(key: LockKey) -> Self {
        let mut keys = SmallVec::new();
        keys.push(key);
        Self { keys }
    }

    /// Scope over `first` plus `rest`; never empty, so never fails.
    pub fn of(first: LockKey, rest: impl IntoIterator<Item = LockKey>) -> Self {
        let mut keys: SmallVec<[LockKey; 4]> = SmallVec::new();
        keys.push(first);
        keys.extend(rest);
        keys.sort();
        keys.dedup();
        Self { keys }
    }

    /// Keys in acquisition order.
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &LockKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

type Registry = Arc<DashMap<LockKey, Arc<Mutex<()>>>>;

/// Registry of per-aggregate mutexes.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct EntityLockManager {
    registry: Registry,
}

impl EntityLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key in `scope`, in ascending key order.
    ///
    /// Waits indefinitely on contention. Dropping the returned future part
    /// way through releases whatever it already took, newest first.
    pub async fn acquire(&self, scope: &LockScope) -> LockHandle {
        let mut handle = LockHandle::new(self.registry.clone());
        for key in scope.keys() {
            if held_by_current_task(key) {
                handle.push_reentrant(key.clone());
                continue;
            }
            let guard = self.mutex_for(key).lock_owned().await;
            handle.push(key.clone(), guard);
        }
        debug!(scope = ?scope.keys(), "lock scope acquired");
        handle
    }

    /// Acquire `scope` without waiting.
    ///
    /// Fails with [`LockError::Contended`] on the first key held by another
    /// task, after releasing every key this call already took.
    pub fn try_acquire(&self, scope: &LockScope) -> Result<LockHandle, LockError> {
        let mut handle = LockHandle::new(self.registry.clone());
        for key in scope.keys() {
            if held_by_current_task(key) {
                handle.push_reentrant(key.clone());
                continue;
            }
            match self.mutex_for(key).try_lock_owned() {
                Ok(guard) => handle.push(key.clone(), guard),
                Err(_) => {
                    evict_if_idle(&self.registry, key);
                    handle.release();
                    debug!(%key, "lock scope contended");
                    return Err(LockError::Contended { key: key.clone() });
                }
            }
        }
        debug!(scope = ?scope.keys(), "lock scope acquired");
        Ok(handle)
    }

    /// Acquire `scope`, giving up once `after` has elapsed for the whole scope.
    pub async fn acquire_timeout(
        &self,
        scope: &LockScope,
        after: Duration,
    ) -> Result<LockHandle, LockError> {
        let deadline = Instant::now() + after;
        let mut handle = LockHandle::new(self.registry.clone());
        for key in scope.keys() {
            if held_by_current_task(key) {
                handle.push_reentrant(key.clone());
                continue;
            }
            let mutex = self.mutex_for(key);
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => handle.push(key.clone(), guard),
                Err(_) => {
                    evict_if_idle(&self.registry, key);
                    handle.release();
                    debug!(%key, ?after, "lock scope timed out");
                    return Err(LockError::TimedOut {
                        key: key.clone(),
                        after,
                    });
                }
            }
        }
        debug!(scope = ?scope.keys(), "lock scope acquired");
        Ok(handle)
    }

    /// Number of keys currently present in the registry.
    pub fn registered_keys(&self) -> usize {
        self.registry.len()
    }

    fn mutex_for(&self, key: &LockKey) -> Arc<Mutex<()>> {
        // Cloned under the shard lock so eviction cannot race the lookup.
        self.registry
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

impl fmt::Debug for EntityLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLockManager")
            .field("registered_keys", &self.registry.len())
            .finish()
    }
}

fn held_by_current_task(key: &LockKey) -> bool {
    HELD_KEYS
        .try_with(|held| held.contains(key))
        .unwrap_or(false)
}

fn evict_if_idle(registry: &Registry, key: &LockKey) {
    // The registry's own Arc is the only reference left: nobody holds or waits.
    registry.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

struct HeldLock {
    key: LockKey,
    /// `None` when the key was already held by the enclosing task.
    guard: Option<OwnedMutexGuard<()>>,
}

/// Ownership of an acquired scope.
///
/// Released on [`release`](LockHandle::release) or drop, whichever comes
/// first, in reverse acquisition order. Releasing twice is a no-op.
pub struct LockHandle {
    registry: Registry,
    held: SmallVec<[HeldLock; 4]>,
}

impl LockHandle {
    fn new(registry: Registry) -> Self {
        Self {
            registry,
            held: SmallVec::new(),
        }
    }

    fn push(&mut self, key: LockKey, guard: OwnedMutexGuard<()>) {
        self.held.push(HeldLock {
            key,
            guard: Some(guard),
        });
    }

    fn push_reentrant(&mut self, key: LockKey) {
        self.held.push(HeldLock { key, guard: None });
    }

    /// Keys covered by this handle, in acquisition order.
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.held.iter().map(|held| &held.key)
    }

    pub fn is_released(&self) -> bool {
        self.held.is_empty()
    }

    /// Run `fut` as the owner of this handle's keys.
    ///
    /// Acquisitions made by `fut` on the current task treat these keys as
    /// already held instead of waiting on them.
    pub async fn hold<F: Future>(&self, fut: F) -> F::Output {
        let mut keys: BTreeSet<LockKey> = HELD_KEYS
            .try_with(|held| (**held).clone())
            .unwrap_or_default();
        keys.extend(self.keys().cloned());
        HELD_KEYS.scope(Arc::new(keys), fut).await
    }

    pub fn release(&mut self) {
        if self.held.is_empty() {
            return;
        }
        while let Some(held) = self.held.pop() {
            if let Some(guard) = held.guard {
                drop(guard);
                evict_if_idle(&self.registry, &held.key);
            }
        }
        debug!("lock scope released");
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}
