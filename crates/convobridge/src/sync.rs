//! Per-key async locks.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// How long an unused lock is kept around.
pub const DEFAULT_IDLE_AGE: Duration = Duration::from_secs(1800);

struct Slot {
    lock: Arc<Mutex<()>>,
    touched: Instant,
}

/// A family of async mutexes, one per key.
///
/// Work on the same key is serialized while different keys proceed in
/// parallel. Keys that have been idle for a while are pruned.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<DashMap<String, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex for `key`, created on first use.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(Mutex::new(())),
            touched: now,
        });
        slot.touched = now;
        Arc::clone(&slot.lock)
    }

    /// Wait for and hold the lock of `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.get(key).lock_owned().await
    }

    /// Drop locks idle for longer than `max_age` that nobody holds or waits on.
    pub fn prune_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            Arc::strong_count(&slot.lock) > 1 || now.duration_since(slot.touched) <= max_age
        });
        before.saturating_sub(self.slots.len())
    }

    /// Prune idle locks every `interval`.
    pub fn spawn_pruner(
        &self,
        interval: Duration,
        max_age: Duration,
        name: &'static str,
    ) -> JoinHandle<()> {
        let locks = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let pruned = locks.prune_idle(max_age);
                if pruned > 0 {
                    debug!(pruned, remaining = locks.len(), locks = name, "Pruned idle locks");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
