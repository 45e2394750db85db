//! Per-volume mutual exclusion.
//!
//! The CO may retry or overlap lifecycle calls for one volume; those must run
//! one at a time. Calls for different volumes never wait on each other.
//! Entries are created on first use and dropped again once nobody holds or
//! waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

use crate::metrics;

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Registry of per-volume locks.
#[derive(Clone, Default)]
pub struct VolumeLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `volume_id`. Released when the guard drops.
    pub async fn acquire(&self, volume_id: &str) -> VolumeLockGuard {
        let start = Instant::now();
        let lock = {
            let mut map = lock_map(&self.locks);
            map.entry(volume_id.to_string()).or_default().clone()
        };

        let guard = lock.lock_owned().await;
        let waited = start.elapsed();
        metrics::record_lock_wait(waited);
        trace!(volume_id = %volume_id, waited = ?waited, "Volume lock acquired");

        VolumeLockGuard {
            volume_id: volume_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of volumes currently tracked.
    #[cfg(test)]
    fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    // The map is only mutated by single insert/remove calls; a panic elsewhere
    // cannot leave it half updated.
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive access to one volume.
pub struct VolumeLockGuard {
    volume_id: String,
    locks: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut map = lock_map(&self.locks);
        // Only the map's own reference left: no holder and no waiters.
        if map
            .get(&self.volume_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.volume_id);
        }
        trace!(volume_id = %self.volume_id, "Volume lock released");
    }
}
