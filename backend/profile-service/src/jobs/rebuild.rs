// ============================================
// Profile Rebuild Job
// ============================================
//
// Recomputes profiles for an explicit list of users from their stored
// history snapshots. Each user goes through the normal admission path, so a
// user with a build already in flight is skipped rather than raced. Distinct
// users are rebuilt concurrently.
//
// Usage:
//   MODE=rebuild REBUILD_USER_IDS=u1,u2 profile-service

use crate::services::coordinator::{BuildOutcome, IngestionCoordinator};
use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RebuildStats {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub users_processed: u32,
    pub users_rebuilt: u32,
    pub users_busy: u32,
    pub users_without_data: u32,
    pub users_failed: u32,
    pub total_duration_ms: u64,
}

const CONCURRENT_REBUILDS: usize = 4;

pub struct RebuildJob {
    coordinator: Arc<IngestionCoordinator>,
}

impl RebuildJob {
    pub fn new(coordinator: Arc<IngestionCoordinator>) -> Self {
        Self { coordinator }
    }

    async fn rebuild_user(&self, user_id: String) -> (String, Result<BuildOutcome>) {
        let outcome = self.coordinator.rebuild_profile(&user_id).await;
        (user_id, outcome)
    }

    pub async fn run(&self, user_ids: &[String]) -> RebuildStats {
        let start_time = Instant::now();
        let mut stats = RebuildStats {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        // Duplicates would only contend with themselves for admission
        let mut seen = HashSet::new();
        let unique: Vec<String> = user_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        info!(user_count = unique.len(), "Starting profile rebuild");

        let results: Vec<(String, Result<BuildOutcome>)> = stream::iter(unique)
            .map(|user_id| self.rebuild_user(user_id))
            .buffer_unordered(CONCURRENT_REBUILDS)
            .collect()
            .await;

        for (user_id, result) in results {
            stats.users_processed += 1;

            match result {
                Ok(BuildOutcome::Built { summary, .. }) => {
                    stats.users_rebuilt += 1;
                    info!(
                        user_id = %user_id,
                        log_count = summary.log_count,
                        total_weight = summary.total_weight,
                        "Profile rebuilt"
                    );
                }
                Ok(BuildOutcome::AlreadyProcessing { started_at }) => {
                    stats.users_busy += 1;
                    warn!(user_id = %user_id, started_at = %started_at, "Build in flight, skipped");
                }
                Ok(BuildOutcome::NoData { .. }) => {
                    stats.users_without_data += 1;
                    warn!(user_id = %user_id, "No history to rebuild from");
                }
                Err(e) => {
                    stats.users_failed += 1;
                    error!(user_id = %user_id, error = %e, "Failed to rebuild profile");
                }
            }
        }

        stats.completed_at = Some(Utc::now());
        stats.total_duration_ms = start_time.elapsed().as_millis() as u64;

        info!(
            processed = stats.users_processed,
            rebuilt = stats.users_rebuilt,
            busy = stats.users_busy,
            no_data = stats.users_without_data,
            failed = stats.users_failed,
            duration_ms = stats.total_duration_ms,
            "Profile rebuild completed"
        );

        stats
    }
}
