//! Per-instance serialization of state-machine transitions.
//!
//! Reviews, expiries and cancellations of the same instance must not
//! interleave between "read current state" and "commit transition".
//! Unrelated instances never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InstanceLocks {
    inner: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `instance_id`.
    pub async fn acquire(&self, instance_id: Uuid) -> InstanceGuard<'_> {
        let mutex = self
            .inner
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        InstanceGuard {
            locks: self,
            instance_id,
            _guard: guard,
        }
    }

    /// Number of instances with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held for the duration of one transition. The registry entry is dropped
/// with the last holder.
pub struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        // One reference in the map, one in our own guard: nobody is waiting.
        self.locks
            .inner
            .remove_if(&self.instance_id, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}
