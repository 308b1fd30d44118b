//! End-to-end ingestion tests over the in-memory stores
//!
//! A keyword embedder stands in for the provider: texts mentioning "alpha"
//! map to [1, 0], "beta" to [0, 1]. That keeps every expected profile
//! computable by hand.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use processing_state::{AdmissionResult, InMemoryProcessingStateStore};
use profile_service::models::{
    BrowsingObservation, HistoryObservation, PageContent, ProfileSource,
};
use profile_service::services::classifier::CategoryVector;
use profile_service::services::{
    BuildOutcome, CategoryClassifier, CoordinatorSettings, IngestionCoordinator,
    ProfileAggregator, UpdateOutcome, UserLockRegistry,
};
use profile_service::storage::{
    EmbeddingProvider, InMemoryObservationStore, InMemoryVectorStore, ObservationStore,
};
use profile_service::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const TOLERANCE: f32 = 1e-5;

struct KeywordEmbedder {
    /// When set, the first batch call blocks until `release` is notified
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl KeywordEmbedder {
    fn new() -> Self {
        Self {
            gated: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn gated() -> Self {
        let embedder = Self::new();
        embedder.gated.store(true, Ordering::SeqCst);
        embedder
    }

    fn vector_for(text: &str) -> Vec<f32> {
        if text.contains("alpha") {
            vec![1.0, 0.0]
        } else if text.contains("beta") {
            vec![0.0, 1.0]
        } else {
            vec![0.6, 0.8]
        }
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::vector_for(text))
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct Harness {
    coordinator: Arc<IngestionCoordinator>,
    observations: Arc<InMemoryObservationStore>,
    vectors: Arc<InMemoryVectorStore>,
    embedder: Arc<KeywordEmbedder>,
}

fn harness_with(
    embedder: KeywordEmbedder,
    classifier: CategoryClassifier,
    timeout: Duration,
) -> Harness {
    let observations = Arc::new(InMemoryObservationStore::new());
    let vectors = Arc::new(InMemoryVectorStore::new());
    let embedder = Arc::new(embedder);

    let coordinator = Arc::new(IngestionCoordinator::new(
        Arc::new(InMemoryProcessingStateStore::new(timeout)),
        observations.clone(),
        vectors.clone(),
        embedder.clone(),
        Arc::new(classifier),
        Arc::new(UserLockRegistry::default()),
        CoordinatorSettings::default(),
    ));

    Harness {
        coordinator,
        observations,
        vectors,
        embedder,
    }
}

fn harness() -> Harness {
    harness_with(
        KeywordEmbedder::new(),
        CategoryClassifier::empty(),
        Duration::from_secs(60),
    )
}

fn content(title: &str, body: &str) -> Option<PageContent> {
    Some(PageContent {
        clean_title: title.to_string(),
        clean_content: body.to_string(),
        ..Default::default()
    })
}

fn history(user_id: &str, url: &str, topic: &str, visits: u32, typed: u32) -> HistoryObservation {
    HistoryObservation {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        url: url.to_string(),
        domain: "example.com".to_string(),
        title: format!("{} news", topic),
        visit_count: visits,
        typed_count: typed,
        total_visits: visits,
        direct_visits: typed,
        last_visit_time: Some(Utc::now() - ChronoDuration::days(1)),
        content: content(&format!("{} news", topic), &format!("all about {}", topic)),
        saved_at: Utc::now(),
    }
}

fn browsing(user_id: &str, url: &str, topic: &str) -> BrowsingObservation {
    BrowsingObservation {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        url: url.to_string(),
        domain: "example.com".to_string(),
        title: format!("{} article", topic),
        time_spent: 0,
        max_scroll_depth: 0,
        visit_count: 0,
        content: content(&format!("{} article", topic), &format!("more on {}", topic)),
        saved_at: Utc::now(),
    }
}

/// alpha typed on 1 of 2 visits (weight 1.5), beta plain (weight 1.0)
fn default_history(user_id: &str) -> Vec<HistoryObservation> {
    vec![
        history(user_id, "https://example.com/alpha", "alpha", 2, 1),
        history(user_id, "https://example.com/beta", "beta", 1, 0),
    ]
}

fn assert_vector(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < TOLERANCE, "{:?} != {:?}", actual, expected);
    }
}

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[test]
fn test_two_observation_profile_then_update() {
    let aggregator = ProfileAggregator::new(2);
    let now = Utc::now();

    let profile = aggregator
        .build_profile(
            "u1",
            &[(vec![1.0, 0.0], 2.0), (vec![0.0, 1.0], 1.0)],
            ProfileSource::HistoryData,
            now,
        )
        .unwrap();

    assert_vector(&profile.vector, &[0.894_427_2, 0.447_213_6]);
    assert_eq!(profile.weight_sum, 3.0);

    let updated = aggregator
        .update_profile(Some(&profile), &[0.0, 1.0], 1.0, now)
        .unwrap();

    assert_eq!(updated.weight_sum, 4.0);
    assert!((norm(&updated.vector) - 1.0).abs() < 1e-6);
    assert!(updated.vector[1] > profile.vector[1]);
    assert!(updated.vector[0] < profile.vector[0]);
}

#[tokio::test]
async fn test_end_to_end_profile_lifecycle() {
    let h = harness();

    let outcome = h
        .coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();

    match &outcome {
        BuildOutcome::Built { summary, replay } => {
            assert_eq!(summary.log_count, 2);
            assert_eq!(summary.skipped, 0);
            assert_eq!(summary.total_weight, 2.5);
            assert_eq!(replay.applied, 0);
        }
        other => panic!("expected Built, got {:?}", other),
    }
    assert_eq!(outcome.status(), "built");

    let profile = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    let n = (1.5f32 * 1.5 + 1.0).sqrt();
    assert_vector(&profile.vector, &[1.5 / n, 1.0 / n]);
    assert_eq!(profile.log_count, 2);
    assert_eq!(profile.max_weight, 1.5);
    assert_eq!(profile.min_weight, 1.0);
    assert_eq!(profile.created_from, ProfileSource::HistoryData);

    let update = h
        .coordinator
        .record_browsing(browsing("u1", "https://example.com/beta-2", "beta"))
        .await
        .unwrap();

    match update {
        UpdateOutcome::Updated {
            weight,
            total_weight,
            ..
        } => {
            assert_eq!(weight, 1.0);
            assert_eq!(total_weight, 3.5);
        }
        other => panic!("expected Updated, got {:?}", other),
    }

    // Exact weighted sum is (1.5, 2.0)
    let profile = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    assert_vector(&profile.vector, &[0.6, 0.8]);
    assert_eq!(profile.weight_sum, 3.5);
    assert_eq!(profile.log_count, 3);
    assert_eq!(profile.avg_weight, 1.167);

    assert_eq!(h.vectors.len("user_profiles").await, 1);
    assert_eq!(h.vectors.len("user_logs").await, 3);
}

#[tokio::test]
async fn test_log_upsert_is_idempotent_per_url() {
    let h = harness();

    h.coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();
    // A second snapshot with the same URLs overwrites the same log points
    h.coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();
    assert_eq!(h.vectors.len("user_logs").await, 2);

    for _ in 0..2 {
        h.coordinator
            .record_browsing(browsing("u1", "https://example.com/gamma", "gamma"))
            .await
            .unwrap();
    }
    assert_eq!(h.vectors.len("user_logs").await, 3);

    let logs = h.vectors.points("user_logs").await;
    let gamma = logs
        .iter()
        .find(|p| p.payload["url"] == "https://example.com/gamma")
        .unwrap();
    assert_eq!(gamma.payload["visit_count"], 2);

    // Still one profile, and each observation counted once
    let profile = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(h.vectors.len("user_profiles").await, 1);
    assert_eq!(profile.weight_sum, 4.5);
}

#[tokio::test]
async fn test_update_without_profile_asks_for_bulk_build() {
    let h = harness();

    let outcome = h
        .coordinator
        .record_browsing(browsing("u1", "https://example.com/alpha", "alpha"))
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::NoProfile);
    assert_eq!(h.vectors.len("user_profiles").await, 0);
    assert_eq!(h.vectors.len("user_logs").await, 0);
}

#[tokio::test]
async fn test_unembeddable_observation_leaves_profile_untouched() {
    let h = harness();
    h.coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();
    let before = h.coordinator.get_profile("u1").await.unwrap().unwrap();

    let mut empty = browsing("u1", "https://example.com/empty", "alpha");
    empty.content = content("   ", "");

    let outcome = h.coordinator.record_browsing(empty).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::NothingToEmbed);

    let after = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_browsing_during_build_is_deferred_then_replayed_in_order() {
    let h = harness_with(
        KeywordEmbedder::gated(),
        CategoryClassifier::empty(),
        Duration::from_secs(60),
    );

    let coordinator = h.coordinator.clone();
    let build = tokio::spawn(async move {
        coordinator
            .ingest_history("u1", default_history("u1"))
            .await
    });

    // Build is now blocked inside the embedding call
    h.embedder.entered.notified().await;
    assert!(h
        .coordinator
        .processing_state("u1")
        .await
        .unwrap()
        .is_some());

    let first = browsing("u1", "https://example.com/beta-2", "beta");
    assert_eq!(
        h.coordinator.record_browsing(first).await.unwrap(),
        UpdateOutcome::Deferred
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = browsing("u1", "https://example.com/alpha-2", "alpha");
    assert_eq!(
        h.coordinator.record_browsing(second).await.unwrap(),
        UpdateOutcome::Deferred
    );

    h.embedder.release.notify_one();
    let outcome = build.await.unwrap().unwrap();

    match outcome {
        BuildOutcome::Built { replay, .. } => {
            assert_eq!(replay.applied, 2);
            assert_eq!(replay.failed, 0);
        }
        other => panic!("expected Built, got {:?}", other),
    }

    let profile = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(profile.weight_sum, 4.5);
    assert_eq!(profile.log_count, 4);

    // Replayed oldest first, so the profile ends on the second observation
    let stored = h
        .observations
        .browsing_since("u1", Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored[0].saved_at <= stored[1].saved_at);
    assert_eq!(profile.last_update, stored[1].saved_at);

    // Weighted sum (1.5 + 1, 1 + 1)
    let n = (2.5f32 * 2.5 + 2.0 * 2.0).sqrt();
    assert_vector(&profile.vector, &[2.5 / n, 2.0 / n]);

    assert!(h
        .coordinator
        .processing_state("u1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_concurrent_bulk_builds_admit_one() {
    let h = harness_with(
        KeywordEmbedder::gated(),
        CategoryClassifier::empty(),
        Duration::from_secs(60),
    );

    h.observations
        .replace_history("u1", default_history("u1"))
        .await
        .unwrap();

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.build_initial_profile("u1").await });

    h.embedder.entered.notified().await;

    let second = h.coordinator.build_initial_profile("u1").await.unwrap();
    assert!(matches!(second, BuildOutcome::AlreadyProcessing { .. }));
    assert_eq!(second.status(), "try_again_shortly");
    assert!(second.is_retryable());

    h.embedder.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(first.is_success());
}

#[tokio::test]
async fn test_expired_processing_state_does_not_block_rebuild() {
    let h = harness_with(
        KeywordEmbedder::new(),
        CategoryClassifier::empty(),
        Duration::from_millis(50),
    );

    // A build that started and never finished
    let admission = h.coordinator.start_bulk_build("u1").await.unwrap();
    assert!(matches!(admission, AdmissionResult::Started(_)));
    assert!(matches!(
        h.coordinator.ingest_history("u1", default_history("u1")).await.unwrap(),
        BuildOutcome::AlreadyProcessing { .. }
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;

    let outcome = h
        .coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_late_build_keeps_newer_admission_and_replays_only_its_window() {
    let h = harness_with(
        KeywordEmbedder::gated(),
        CategoryClassifier::empty(),
        Duration::from_millis(300),
    );

    let coordinator = h.coordinator.clone();
    let late = tokio::spawn(async move {
        coordinator
            .ingest_history("u1", default_history("u1"))
            .await
    });
    h.embedder.entered.notified().await;

    assert_eq!(
        h.coordinator
            .record_browsing(browsing("u1", "https://example.com/beta-2", "beta"))
            .await
            .unwrap(),
        UpdateOutcome::Deferred
    );

    // Outlive the first admission, then admit a second build
    tokio::time::sleep(Duration::from_millis(400)).await;
    let newer = match h.coordinator.start_bulk_build("u1").await.unwrap() {
        AdmissionResult::Started(state) => state,
        other => panic!("expected Started, got {:?}", other),
    };

    h.embedder.release.notify_one();
    match late.await.unwrap().unwrap() {
        BuildOutcome::Built { replay, .. } => assert_eq!(replay.applied, 1),
        other => panic!("expected Built, got {:?}", other),
    }

    let live = h
        .coordinator
        .processing_state("u1")
        .await
        .unwrap()
        .expect("newer admission must survive the late finish");
    assert_eq!(live.started_at, newer.started_at);
    assert!(matches!(
        h.coordinator.build_initial_profile("u1").await.unwrap(),
        BuildOutcome::AlreadyProcessing { .. }
    ));

    assert!(h
        .coordinator
        .finish_bulk_build("u1", newer.started_at)
        .await
        .unwrap());

    let profile = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(profile.weight_sum, 3.5);
    assert_eq!(profile.log_count, 3);
}

#[tokio::test]
async fn test_apply_update_defers_while_build_is_live() {
    let h = harness();
    h.coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();

    let state = match h.coordinator.start_bulk_build("u1").await.unwrap() {
        AdmissionResult::Started(state) => state,
        other => panic!("expected Started, got {:?}", other),
    };

    let stored = h
        .observations
        .save_browsing(browsing("u1", "https://example.com/beta-2", "beta"))
        .await
        .unwrap();

    assert_eq!(
        h.coordinator.apply_update(&stored).await.unwrap(),
        UpdateOutcome::Deferred
    );
    let profile = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(profile.weight_sum, 2.5);

    assert!(h
        .coordinator
        .finish_bulk_build("u1", state.started_at)
        .await
        .unwrap());

    assert!(matches!(
        h.coordinator.apply_update(&stored).await.unwrap(),
        UpdateOutcome::Updated { total_weight, .. } if total_weight == 3.5
    ));
}

#[tokio::test]
async fn test_observations_are_tagged_with_categories() {
    let classifier = CategoryClassifier::new(vec![
        CategoryVector {
            id: 0,
            name: "Politics".to_string(),
            vector: vec![1.0, 0.0],
        },
        CategoryVector {
            id: 3,
            name: "Technology".to_string(),
            vector: vec![0.0, 1.0],
        },
    ]);
    let h = harness_with(KeywordEmbedder::new(), classifier, Duration::from_secs(60));

    let records = default_history("u1");
    let alpha_id = records[0].id;
    let beta_id = records[1].id;
    h.coordinator.ingest_history("u1", records).await.unwrap();

    assert_eq!(
        h.observations.category_of("u1", alpha_id).await,
        Some(("Politics".to_string(), 1.0))
    );
    assert_eq!(
        h.observations.category_of("u1", beta_id).await,
        Some(("Technology".to_string(), 1.0))
    );

    let observation = browsing("u1", "https://example.com/beta-2", "beta");
    let observation_id = observation.id;
    match h.coordinator.record_browsing(observation).await.unwrap() {
        UpdateOutcome::Updated { category, .. } => {
            assert_eq!(category.unwrap().category, "Technology");
        }
        other => panic!("expected Updated, got {:?}", other),
    }
    assert_eq!(
        h.observations.category_of("u1", observation_id).await,
        Some(("Technology".to_string(), 1.0))
    );

    let logs = h.vectors.points("user_logs").await;
    assert!(logs
        .iter()
        .all(|p| p.payload["category"] == "Politics" || p.payload["category"] == "Technology"));
}

#[tokio::test]
async fn test_profiles_are_independent_across_users() {
    let h = harness();

    h.coordinator
        .ingest_history("u1", default_history("u1"))
        .await
        .unwrap();
    h.coordinator
        .ingest_history(
            "u2",
            vec![history("u2", "https://example.com/beta", "beta", 1, 0)],
        )
        .await
        .unwrap();

    let u1 = h.coordinator.get_profile("u1").await.unwrap().unwrap();
    let u2 = h.coordinator.get_profile("u2").await.unwrap().unwrap();

    assert_eq!(u1.weight_sum, 2.5);
    assert_eq!(u2.weight_sum, 1.0);
    assert_vector(&u2.vector, &[0.0, 1.0]);
    // Same URL, different users: separate log points
    assert_eq!(h.vectors.len("user_logs").await, 3);
}
