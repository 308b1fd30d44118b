use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Clone)]
struct LockSlot {
    lock: Arc<Mutex<()>>,
    /// Milliseconds since the registry was created
    last_used: Arc<AtomicU64>,
}

/// Per-user async mutexes serializing profile read-modify-write within this
/// process.
///
/// Slots are created on first use. Once the registry grows past `capacity`,
/// slots that nobody holds or waits on and that have been idle longer than
/// `max_idle` are dropped. Cross-process exclusion is the job of the
/// processing-state store, not of this registry.
pub struct UserLockRegistry {
    slots: DashMap<String, LockSlot>,
    max_idle: Duration,
    capacity: usize,
    epoch: Instant,
}

impl UserLockRegistry {
    pub fn new(max_idle: Duration, capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            max_idle,
            capacity,
            epoch: Instant::now(),
        }
    }

    /// Waits for and returns the user's lock
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        self.handle(user_id).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn handle(&self, user_id: &str) -> Arc<Mutex<()>> {
        let now = self.elapsed_ms();

        let lock = {
            let slot = self
                .slots
                .entry(user_id.to_string())
                .or_insert_with(|| LockSlot {
                    lock: Arc::new(Mutex::new(())),
                    last_used: Arc::new(AtomicU64::new(now)),
                });
            slot.last_used.store(now, Ordering::Relaxed);
            slot.lock.clone()
        };

        if self.slots.len() > self.capacity {
            self.evict_idle();
        }

        lock
    }

    /// Drops idle, unheld slots; returns how many were removed
    pub fn evict_idle(&self) -> usize {
        let now = self.elapsed_ms();
        let max_idle = self.max_idle.as_millis() as u64;
        let before = self.slots.len();

        self.slots.retain(|_, slot| {
            // Any clone outside the map is a holder or a waiter
            let in_use = Arc::strong_count(&slot.lock) > 1;
            let idle_for = now.saturating_sub(slot.last_used.load(Ordering::Relaxed));
            in_use || idle_for < max_idle
        });

        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.slots.len(), "Evicted idle user locks");
        }
        evicted
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for UserLockRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 10_000)
    }
}
