// ============================================
// Processing State Sweeper
// ============================================
//
// Periodically deletes processing states whose TTL has passed. Admission
// already ignores expired records, so this only keeps the table small and
// the records of crashed builds from lingering.

use processing_state::ProcessingStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    pub passes: u64,
    pub removed: u64,
    pub failures: u64,
}

pub struct StateSweeperJob {
    store: Arc<dyn ProcessingStateStore>,
    interval: Duration,
}

impl StateSweeperJob {
    pub fn new(store: Arc<dyn ProcessingStateStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// One sweep; store failures are logged and counted, never fatal
    pub async fn run_once(&self, stats: &mut SweepStats) {
        stats.passes += 1;
        match self.store.cleanup_expired().await {
            Ok(removed) => {
                stats.removed += removed;
                debug!(removed, "Processing state sweep completed");
            }
            Err(e) => {
                stats.failures += 1;
                error!(error = %e, "Processing state sweep failed");
            }
        }
    }

    /// Sweeps every `interval` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Processing state sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once(&mut stats).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            passes = stats.passes,
            removed = stats.removed,
            failures = stats.failures,
            "Processing state sweeper stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use processing_state::InMemoryProcessingStateStore;

    #[tokio::test]
    async fn test_sweeper_removes_expired_until_shutdown() {
        let store = Arc::new(InMemoryProcessingStateStore::new(Duration::from_millis(10)));
        store.try_start("u1").await.unwrap();
        store.try_start("u2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let job = StateSweeperJob::new(store.clone(), Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { job.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert!(stats.passes >= 1);
        assert_eq!(stats.removed, 2);
        assert!(store.is_empty().await);
    }
}
