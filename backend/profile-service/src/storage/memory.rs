//! In-process stores for tests and local runs

use super::{CategoryTag, ObservationStore, PointId, ScoredPoint, VectorPoint, VectorStore};
use crate::error::{AppError, Result};
use crate::models::{BrowsingObservation, DataSource, HistoryObservation};
use crate::services::classifier::cosine_similarity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

// ============================================
// Vector store
// ============================================

#[derive(Default)]
pub struct InMemoryVectorStore {
    // Insertion order is kept so "first match" is deterministic
    collections: RwLock<HashMap<String, Vec<VectorPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn points(&self, collection: &str) -> Vec<VectorPoint> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, collection: &str, _dimension: usize) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let stored = collections.entry(collection.to_string()).or_default();

        for point in points {
            match stored.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => stored.push(point),
            }
        }
        Ok(())
    }

    async fn get_by_id(&self, collection: &str, id: &PointId) -> Result<Option<VectorPoint>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|points| points.iter().find(|p| &p.id == id).cloned()))
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<VectorPoint>> {
        Ok(self.collections.read().await.get(collection).and_then(|points| {
            points
                .iter()
                .find(|p| p.payload.get(field).and_then(|v| v.as_str()) == Some(value))
                .cloned()
        }))
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().await;
        let Some(points) = collections.get(collection) else {
            return Err(AppError::VectorStore(format!(
                "Collection {} not found",
                collection
            )));
        };

        let mut hits: Vec<ScoredPoint> = points
            .iter()
            .filter(|p| p.vector.len() == query.len())
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(query, &p.vector),
                payload: p.payload.clone(),
            })
            .filter(|hit| score_threshold.map_or(true, |t| hit.score >= t))
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

// ============================================
// Observation store
// ============================================

#[derive(Debug, Clone)]
struct Tagged<T> {
    record: T,
    category: Option<(String, f32)>,
}

#[derive(Default)]
struct UserObservations {
    browsing: Vec<Tagged<BrowsingObservation>>,
    history: Vec<Tagged<HistoryObservation>>,
}

#[derive(Default)]
pub struct InMemoryObservationStore {
    users: RwLock<HashMap<String, UserObservations>>,
}

impl InMemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Category tag written for an observation, if any
    pub async fn category_of(&self, user_id: &str, observation_id: Uuid) -> Option<(String, f32)> {
        let users = self.users.read().await;
        let user = users.get(user_id)?;

        user.browsing
            .iter()
            .find(|t| t.record.id == observation_id)
            .map(|t| t.category.clone())
            .or_else(|| {
                user.history
                    .iter()
                    .find(|t| t.record.id == observation_id)
                    .map(|t| t.category.clone())
            })
            .flatten()
    }
}

#[async_trait]
impl ObservationStore for InMemoryObservationStore {
    async fn save_browsing(
        &self,
        mut observation: BrowsingObservation,
    ) -> Result<BrowsingObservation> {
        let mut users = self.users.write().await;
        let user = users.entry(observation.user_id.clone()).or_default();

        let previous = user
            .browsing
            .iter()
            .filter(|t| t.record.url == observation.url)
            .map(|t| t.record.visit_count)
            .max();
        observation.visit_count = previous.map(|count| count + 1).unwrap_or(1);

        user.browsing.push(Tagged {
            record: observation.clone(),
            category: None,
        });
        Ok(observation)
    }

    async fn replace_history(
        &self,
        user_id: &str,
        records: Vec<HistoryObservation>,
    ) -> Result<usize> {
        let mut users = self.users.write().await;
        let user = users.entry(user_id.to_string()).or_default();

        user.history = records
            .into_iter()
            .map(|mut record| {
                record.user_id = user_id.to_string();
                Tagged {
                    record,
                    category: None,
                }
            })
            .collect();
        Ok(user.history.len())
    }

    async fn recent_history(&self, user_id: &str, limit: u32) -> Result<Vec<HistoryObservation>> {
        let users = self.users.read().await;
        let mut records: Vec<HistoryObservation> = users
            .get(user_id)
            .map(|u| u.history.iter().map(|t| t.record.clone()).collect())
            .unwrap_or_default();

        records.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn browsing_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BrowsingObservation>> {
        let users = self.users.read().await;
        let mut records: Vec<BrowsingObservation> = users
            .get(user_id)
            .map(|u| {
                u.browsing
                    .iter()
                    .filter(|t| t.record.saved_at >= since)
                    .map(|t| t.record.clone())
                    .collect()
            })
            .unwrap_or_default();

        // Stable sort keeps arrival order for equal timestamps
        records.sort_by_key(|r| r.saved_at);
        Ok(records)
    }

    async fn tag_categories(
        &self,
        user_id: &str,
        source: DataSource,
        tags: &[CategoryTag],
    ) -> Result<u64> {
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(user_id) else {
            return Ok(0);
        };

        let mut updated = 0;
        for tag in tags {
            let slot = match source {
                DataSource::Browsing => user
                    .browsing
                    .iter_mut()
                    .find(|t| t.record.id == tag.observation_id)
                    .map(|t| &mut t.category),
                DataSource::History => user
                    .history
                    .iter_mut()
                    .find(|t| t.record.id == tag.observation_id)
                    .map(|t| &mut t.category),
            };
            if let Some(slot) = slot {
                *slot = Some((tag.category.clone(), tag.score));
                updated += 1;
            }
        }
        Ok(updated)
    }
}
