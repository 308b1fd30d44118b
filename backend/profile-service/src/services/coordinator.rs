// ============================================
// Ingestion Coordinator
// ============================================
//
// Orchestrates the two ingestion paths for a user:
//
// - Bulk build: admission through the processing-state store, embed the
//   newest history snapshot, commit the profile once, finish, then replay
//   browsing observations that arrived while the build was running.
// - Streaming: each browsing observation is persisted, then either deferred
//   (a build is live) or folded into the profile under the per-user lock.
//
// Admission, the streaming critical section, and finish + replay all run under
// the same in-process user lock, so an observation is applied exactly once:
// either directly, or by the replay that follows the build it overlapped.
// A build replays only the window its own record was live, [started_at,
// expires_at); anything later was applied directly or belongs to the next
// build.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    profile_point_id, BrowsingObservation, DataSource, HistoryObservation, LogEntry, Observed,
    ProfileSource, UserProfile,
};
use crate::services::aggregator::{AggregateError, ProfileAggregator};
use crate::services::classifier::{CategoryAssignment, CategoryClassifier};
use crate::services::user_locks::UserLockRegistry;
use crate::services::weight_model;
use crate::storage::{
    CategoryTag, EmbeddingProvider, ObservationStore, PointId, VectorPoint, VectorStore,
};
use chrono::{DateTime, Utc};
use processing_state::{AdmissionResult, ProcessingState, ProcessingStateStore};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================
// Outcomes
// ============================================

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    pub user_id: String,
    /// Observations folded into the profile
    pub log_count: usize,
    /// Observations without embeddable text
    pub skipped: usize,
    pub total_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplaySummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Result of a bulk build request
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Built {
        summary: BuildSummary,
        replay: ReplaySummary,
    },
    /// Another build for this user is in flight; retry later
    AlreadyProcessing { started_at: DateTime<Utc> },
    /// No stored history, or none of it could be embedded
    NoData { replay: ReplaySummary },
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Built { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildOutcome::AlreadyProcessing { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            BuildOutcome::Built { .. } => "built",
            BuildOutcome::AlreadyProcessing { .. } => "try_again_shortly",
            BuildOutcome::NoData { .. } => "no_data",
        }
    }
}

/// Result of folding one streaming observation
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated {
        weight: f64,
        total_weight: f64,
        category: Option<CategoryAssignment>,
    },
    /// Stored; it will be replayed when the running bulk build finishes
    Deferred,
    /// The user has no profile yet; a bulk build is required
    NoProfile,
    /// Nothing to embed; state left untouched
    NothingToEmbed,
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Updated { .. } | UpdateOutcome::Deferred)
    }

    pub fn status(&self) -> &'static str {
        match self {
            UpdateOutcome::Updated { .. } => "updated",
            UpdateOutcome::Deferred => "deferred",
            UpdateOutcome::NoProfile => "no_profile",
            UpdateOutcome::NothingToEmbed => "nothing_to_embed",
        }
    }
}

// ============================================
// Coordinator
// ============================================

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub log_collection: String,
    pub profile_collection: String,
    pub history_limit: u32,
    pub max_content_chars: usize,
    pub chunk_size: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            log_collection: config.qdrant.log_collection.clone(),
            profile_collection: config.qdrant.profile_collection.clone(),
            history_limit: config.ingestion.history_limit,
            max_content_chars: config.ingestion.max_content_chars,
            chunk_size: config.embedding.chunk_size,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            log_collection: "user_logs".to_string(),
            profile_collection: "user_profiles".to_string(),
            history_limit: 500,
            max_content_chars: 1500,
            chunk_size: 20,
        }
    }
}

/// A profile together with the point it was read from
#[derive(Debug, Clone)]
struct StoredProfile {
    point_id: PointId,
    profile: UserProfile,
}

pub struct IngestionCoordinator {
    states: Arc<dyn ProcessingStateStore>,
    observations: Arc<dyn ObservationStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    classifier: Arc<CategoryClassifier>,
    locks: Arc<UserLockRegistry>,
    aggregator: ProfileAggregator,
    settings: CoordinatorSettings,
}

impl IngestionCoordinator {
    pub fn new(
        states: Arc<dyn ProcessingStateStore>,
        observations: Arc<dyn ObservationStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        classifier: Arc<CategoryClassifier>,
        locks: Arc<UserLockRegistry>,
        settings: CoordinatorSettings,
    ) -> Self {
        let aggregator = ProfileAggregator::new(embedder.dimension());
        Self {
            states,
            observations,
            vectors,
            embedder,
            classifier,
            locks,
            aggregator,
            settings,
        }
    }

    // ------------------------------------------
    // Admission
    // ------------------------------------------

    /// Records a processing state for `user_id`, or reports the live one
    pub async fn start_bulk_build(&self, user_id: &str) -> Result<AdmissionResult> {
        let _guard = self.locks.lock(user_id).await;
        Ok(self.states.try_start(user_id).await?)
    }

    /// Clears the processing state admitted at `started_at`; `false` when it
    /// had expired and was replaced or removed
    pub async fn finish_bulk_build(&self, user_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.states.finish(user_id, started_at).await?)
    }

    pub async fn processing_state(&self, user_id: &str) -> Result<Option<ProcessingState>> {
        Ok(self.states.get(user_id).await?)
    }

    // ------------------------------------------
    // Bulk build
    // ------------------------------------------

    /// Stores a fresh history snapshot and builds the profile from it
    pub async fn ingest_history(
        &self,
        user_id: &str,
        records: Vec<HistoryObservation>,
    ) -> Result<BuildOutcome> {
        self.run_bulk(user_id, Some(records), ProfileSource::HistoryData)
            .await
    }

    /// Builds the profile from the stored history snapshot
    pub async fn build_initial_profile(&self, user_id: &str) -> Result<BuildOutcome> {
        self.run_bulk(user_id, None, ProfileSource::HistoryData).await
    }

    /// Recomputes an existing profile from the stored history snapshot
    pub async fn rebuild_profile(&self, user_id: &str) -> Result<BuildOutcome> {
        self.run_bulk(user_id, None, ProfileSource::Rebuild).await
    }

    async fn run_bulk(
        &self,
        user_id: &str,
        snapshot: Option<Vec<HistoryObservation>>,
        source: ProfileSource,
    ) -> Result<BuildOutcome> {
        let state = match self.start_bulk_build(user_id).await? {
            AdmissionResult::Started(state) => state,
            AdmissionResult::AlreadyProcessing(existing) => {
                warn!(
                    user_id = %user_id,
                    started_at = %existing.started_at,
                    "Bulk build already in progress"
                );
                return Ok(BuildOutcome::AlreadyProcessing {
                    started_at: existing.started_at,
                });
            }
        };

        info!(user_id = %user_id, started_at = %state.started_at, "Bulk build started");

        let body = self.admitted_build(user_id, snapshot, source).await;

        if let Err(err) = &body {
            error!(user_id = %user_id, error = %err, "Bulk build failed");
        }

        // Finish and replay regardless of how the build went
        let guard = self.locks.lock(user_id).await;
        if !self.finish_bulk_build(user_id, state.started_at).await? {
            warn!(
                user_id = %user_id,
                started_at = %state.started_at,
                expires_at = %state.expires_at,
                "Bulk build outlived its processing state"
            );
        }
        let replay = self
            .replay_window(user_id, state.started_at, state.expires_at)
            .await?;
        drop(guard);

        let outcome = match body? {
            Some(summary) => {
                info!(
                    user_id = %user_id,
                    log_count = summary.log_count,
                    skipped = summary.skipped,
                    total_weight = summary.total_weight,
                    replayed = replay.applied,
                    "Bulk build finished"
                );
                BuildOutcome::Built { summary, replay }
            }
            None => BuildOutcome::NoData { replay },
        };

        Ok(outcome)
    }

    async fn admitted_build(
        &self,
        user_id: &str,
        snapshot: Option<Vec<HistoryObservation>>,
        source: ProfileSource,
    ) -> Result<Option<BuildSummary>> {
        if let Some(records) = snapshot {
            self.observations.replace_history(user_id, records).await?;
        }
        self.build_from_history(user_id, source).await
    }

    /// The build body. `None` when there is nothing to build from.
    async fn build_from_history(
        &self,
        user_id: &str,
        source: ProfileSource,
    ) -> Result<Option<BuildSummary>> {
        let history = self
            .observations
            .recent_history(user_id, self.settings.history_limit)
            .await?;

        if history.is_empty() {
            warn!(user_id = %user_id, "No history data to build from");
            return Ok(None);
        }

        let mut texts = Vec::with_capacity(history.len());
        let mut valid = Vec::with_capacity(history.len());
        for record in &history {
            match record.text_for_embedding(self.settings.max_content_chars) {
                Some(text) => {
                    texts.push(text);
                    valid.push(record);
                }
                None => debug!(user_id = %user_id, url = %record.url, "Skipping unembeddable record"),
            }
        }

        let skipped = history.len() - valid.len();
        if valid.is_empty() {
            warn!(user_id = %user_id, skipped, "No embeddable history data");
            return Ok(None);
        }

        let vectors = self.embed_in_chunks(user_id, &texts).await?;
        let weights: Vec<f64> = valid
            .iter()
            .map(|record| weight_model::weight_of(*record))
            .collect();

        let assignments = self.classifier.classify_batch(&vectors);
        self.write_category_tags(
            user_id,
            DataSource::History,
            valid.iter().map(|r| r.id).zip(assignments.iter()),
        )
        .await;

        let pairs: Vec<(Vec<f32>, f64)> = vectors.iter().cloned().zip(weights.iter().copied()).collect();
        let profile = match self
            .aggregator
            .build_profile(user_id, &pairs, source, Utc::now())
        {
            Ok(profile) => profile,
            Err(AggregateError::NoData) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // Log entries are idempotent by point id, so a retry after a partial
        // write converges
        let log_points = valid
            .iter()
            .zip(vectors)
            .zip(weights)
            .zip(assignments)
            .map(|(((record, vector), weight), assignment)| {
                let mut entry = LogEntry::from_observation(*record, vector, weight);
                if let Some(assignment) = assignment {
                    entry.category = Some(assignment.category);
                    entry.category_score = Some(assignment.score);
                }
                log_point(entry)
            })
            .collect::<Result<Vec<_>>>()?;

        self.vectors
            .upsert(&self.settings.log_collection, log_points)
            .await?;

        let summary = BuildSummary {
            user_id: user_id.to_string(),
            log_count: valid.len(),
            skipped,
            total_weight: profile.weight_sum,
        };

        // Single atomic commit of vector and weight_sum
        let point_id = match self.load_profile(user_id).await? {
            Some(existing) => existing.point_id,
            None => PointId::Uuid(profile.point_id()),
        };
        self.vectors
            .upsert(
                &self.settings.profile_collection,
                vec![profile_point(point_id, &profile)?],
            )
            .await?;

        info!(
            user_id = %user_id,
            log_count = profile.log_count,
            total_weight = profile.weight_sum,
            "Profile committed"
        );

        Ok(Some(summary))
    }

    async fn embed_in_chunks(&self, user_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let chunk_size = self.settings.chunk_size.max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for (index, chunk) in texts.chunks(chunk_size).enumerate() {
            debug!(
                user_id = %user_id,
                chunk = index,
                size = chunk.len(),
                "Embedding chunk"
            );
            let embedded = self.embedder.encode_batch(chunk).await?;
            if embedded.len() != chunk.len() {
                return Err(AppError::Embedding(format!(
                    "Expected {} embeddings, got {}",
                    chunk.len(),
                    embedded.len()
                )));
            }
            vectors.extend(embedded);
        }

        Ok(vectors)
    }

    async fn replay_window(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<ReplaySummary> {
        let mut pending = self.observations.browsing_since(user_id, since).await?;
        pending.retain(|observation| observation.saved_at < until);
        let mut summary = ReplaySummary::default();

        if pending.is_empty() {
            return Ok(summary);
        }

        info!(user_id = %user_id, count = pending.len(), "Replaying deferred browsing data");

        for observation in &pending {
            match self.apply_locked(observation).await {
                Ok(UpdateOutcome::Updated { .. }) => summary.applied += 1,
                Ok(outcome) => {
                    debug!(user_id = %user_id, status = outcome.status(), "Replay item not applied");
                    summary.skipped += 1;
                }
                Err(err) => {
                    warn!(user_id = %user_id, url = %observation.url, error = %err, "Replay item failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            user_id = %user_id,
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            "Replay finished"
        );
        Ok(summary)
    }

    // ------------------------------------------
    // Streaming
    // ------------------------------------------

    /// Persists a browsing observation and folds it into the profile, or
    /// defers it while a bulk build is running.
    pub async fn record_browsing(&self, mut observation: BrowsingObservation) -> Result<UpdateOutcome> {
        let _guard = self.locks.lock(&observation.user_id).await;

        observation.saved_at = Utc::now();
        let observation = self.observations.save_browsing(observation).await?;

        if self.states.is_processing(&observation.user_id).await? {
            debug!(user_id = %observation.user_id, "Bulk build in progress, deferring update");
            return Ok(UpdateOutcome::Deferred);
        }

        self.apply_locked(&observation).await
    }

    /// Folds an already-stored observation into the profile, or defers it to
    /// the replay of a live bulk build
    pub async fn apply_update(&self, observation: &BrowsingObservation) -> Result<UpdateOutcome> {
        let _guard = self.locks.lock(&observation.user_id).await;

        if self.states.is_processing(&observation.user_id).await? {
            debug!(user_id = %observation.user_id, "Bulk build in progress, deferring update");
            return Ok(UpdateOutcome::Deferred);
        }

        self.apply_locked(observation).await
    }

    /// Incremental update; the caller holds the user lock
    async fn apply_locked(&self, observation: &BrowsingObservation) -> Result<UpdateOutcome> {
        let user_id = observation.user_id.as_str();

        let Some(text) = observation.text_for_embedding(self.settings.max_content_chars) else {
            warn!(user_id = %user_id, url = %observation.url, "Nothing to embed");
            return Ok(UpdateOutcome::NothingToEmbed);
        };

        let Some(stored) = self.load_profile(user_id).await? else {
            warn!(user_id = %user_id, "No profile yet; waiting for a bulk build");
            return Ok(UpdateOutcome::NoProfile);
        };

        let vector = self.embedder.encode(&text).await?;
        let weight = weight_model::weight_of(observation);

        let updated = self.aggregator.update_profile(
            Some(&stored.profile),
            &vector,
            weight,
            observation.saved_at,
        )?;

        let category = self.classifier.classify(&vector);

        let mut entry = LogEntry::from_observation(observation, vector, weight);
        if let Some(assignment) = &category {
            entry.category = Some(assignment.category.clone());
            entry.category_score = Some(assignment.score);
        }

        self.vectors
            .upsert(&self.settings.log_collection, vec![log_point(entry)?])
            .await?;
        self.vectors
            .upsert(
                &self.settings.profile_collection,
                vec![profile_point(stored.point_id, &updated)?],
            )
            .await?;

        self.write_category_tags(
            user_id,
            DataSource::Browsing,
            std::iter::once((observation.id, &category)),
        )
        .await;

        info!(
            user_id = %user_id,
            weight,
            old_weight = stored.profile.weight_sum,
            total_weight = updated.weight_sum,
            "Profile updated"
        );

        Ok(UpdateOutcome::Updated {
            weight,
            total_weight: updated.weight_sum,
            category,
        })
    }

    // ------------------------------------------
    // Profiles
    // ------------------------------------------

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.load_profile(user_id).await?.map(|stored| stored.profile))
    }

    /// Deterministic point first, then a payload lookup for profiles written
    /// under another id
    async fn load_profile(&self, user_id: &str) -> Result<Option<StoredProfile>> {
        let collection = &self.settings.profile_collection;
        let point_id = PointId::Uuid(profile_point_id(user_id));

        let point = match self.vectors.get_by_id(collection, &point_id).await? {
            Some(point) => Some(point),
            None => self.vectors.find_by_field(collection, "user_id", user_id).await?,
        };

        let Some(point) = point else {
            return Ok(None);
        };

        if point.vector.is_empty() {
            return Err(AppError::VectorStore(format!(
                "Profile point {} for user {} has no vector",
                point.id, user_id
            )));
        }

        let mut profile: UserProfile = serde_json::from_value(point.payload)?;
        profile.vector = point.vector;

        Ok(Some(StoredProfile {
            point_id: point.id,
            profile,
        }))
    }

    /// Tagging is best effort; failures only log
    async fn write_category_tags<'a, I>(&self, user_id: &str, source: DataSource, assignments: I)
    where
        I: Iterator<Item = (uuid::Uuid, &'a Option<CategoryAssignment>)>,
    {
        let tags: Vec<CategoryTag> = assignments
            .filter_map(|(observation_id, assignment)| {
                assignment.as_ref().map(|a| CategoryTag {
                    observation_id,
                    category: a.category.clone(),
                    score: a.score,
                })
            })
            .collect();

        if tags.is_empty() {
            return;
        }

        if let Err(err) = self
            .observations
            .tag_categories(user_id, source, &tags)
            .await
        {
            warn!(user_id = %user_id, error = %err, "Failed to write category tags");
        }
    }
}

fn log_point(entry: LogEntry) -> Result<VectorPoint> {
    Ok(VectorPoint {
        id: PointId::Uuid(entry.point_id()),
        payload: serde_json::to_value(&entry)?,
        vector: entry.vector,
    })
}

fn profile_point(id: PointId, profile: &UserProfile) -> Result<VectorPoint> {
    Ok(VectorPoint {
        id,
        vector: profile.vector.clone(),
        payload: serde_json::to_value(profile)?,
    })
}
