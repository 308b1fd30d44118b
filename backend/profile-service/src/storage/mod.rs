//! External collaborators: embedding provider, vector store and the sharded
//! observation store.

pub mod embeddings;
pub mod memory;
pub mod observations;
pub mod qdrant;

use crate::error::Result;
use crate::models::{BrowsingObservation, DataSource, HistoryObservation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use embeddings::OpenAiEmbeddingProvider;
pub use memory::{InMemoryObservationStore, InMemoryVectorStore};
pub use observations::PgObservationStore;
pub use qdrant::QdrantVectorStore;

// ============================================
// Embedding provider
// ============================================

/// Turns text into vectors. Implementations fail explicitly when the provider
/// is unavailable, never by returning zero vectors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// One vector per input text, in input order
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

// ============================================
// Vector store
// ============================================

/// Point identifier: category reference points use small integers, everything
/// else deterministic UUIDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointId {
    Num(u64),
    Uuid(Uuid),
}

impl From<u64> for PointId {
    fn from(id: u64) -> Self {
        PointId::Num(id)
    }
}

impl From<Uuid> for PointId {
    fn from(id: Uuid) -> Self {
        PointId::Uuid(id)
    }
}

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointId::Num(id) => write!(f, "{}", id),
            PointId::Uuid(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub id: PointId,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: PointId,
    pub score: f32,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Creates a cosine-distance collection of `dimension` if it does not exist
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()>;

    /// Insert or overwrite by id
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    async fn get_by_id(&self, collection: &str, id: &PointId) -> Result<Option<VectorPoint>>;

    /// First point whose payload `field` equals `value`
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<VectorPoint>>;

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>>;
}

// ============================================
// Observation store
// ============================================

/// Per-user sharded store of raw observations
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Persists a browsing observation. `visit_count` is assigned here as the
    /// highest count stored for the same user and URL plus one.
    async fn save_browsing(&self, observation: BrowsingObservation) -> Result<BrowsingObservation>;

    /// Replaces the user's history snapshot; returns the number of rows stored
    async fn replace_history(&self, user_id: &str, records: Vec<HistoryObservation>)
        -> Result<usize>;

    /// Newest first by `saved_at`
    async fn recent_history(&self, user_id: &str, limit: u32) -> Result<Vec<HistoryObservation>>;

    /// Browsing observations with `saved_at >= since`, oldest first
    async fn browsing_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BrowsingObservation>>;

    /// Writes category tags back onto stored observations; returns rows updated
    async fn tag_categories(
        &self,
        user_id: &str,
        source: DataSource,
        tags: &[CategoryTag],
    ) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTag {
    pub observation_id: Uuid,
    pub category: String,
    pub score: f32,
}
