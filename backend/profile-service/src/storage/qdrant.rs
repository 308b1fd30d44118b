// ============================================
// Qdrant vector store (REST)
// ============================================

use super::{PointId, ScoredPoint, VectorPoint, VectorStore};
use crate::config::QdrantConfig;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

pub struct QdrantVectorStore {
    client: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Serialize, Deserialize)]
struct RawPoint {
    id: PointId,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<RawPoint>,
}

#[derive(Deserialize)]
struct RawScoredPoint {
    id: PointId,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

impl From<RawPoint> for VectorPoint {
    fn from(raw: RawPoint) -> Self {
        Self {
            id: raw.id,
            vector: raw.vector.unwrap_or_default(),
            payload: raw.payload.unwrap_or(serde_json::Value::Null),
        }
    }
}

impl QdrantVectorStore {
    pub fn new(config: &QdrantConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::VectorStore(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| AppError::VectorStore(format!("Qdrant request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::VectorStore(format!(
                "Qdrant returned {}: {}",
                status, error_text
            )));
        }

        let body: QdrantResponse<T> = response
            .json()
            .await
            .map_err(|e| AppError::VectorStore(format!("Parse error: {}", e)))?;
        Ok(body.result)
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        let path = format!("/collections/{}", collection);
        let response = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .await
            .map_err(|e| AppError::VectorStore(format!("Qdrant request failed: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                let body = json!({
                    "vectors": { "size": dimension, "distance": "Cosine" }
                });
                let _: serde_json::Value = self
                    .send(self.client.put(self.url(&path)).json(&body))
                    .await?;
                info!(collection, dimension, "Created vector collection");
                Ok(())
            }
            status => Err(AppError::VectorStore(format!(
                "Unexpected status {} checking collection {}",
                status, collection
            ))),
        }
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let count = points.len();
        let points: Vec<RawPoint> = points
            .into_iter()
            .map(|p| RawPoint {
                id: p.id,
                vector: Some(p.vector),
                payload: Some(p.payload),
            })
            .collect();

        let path = format!("/collections/{}/points?wait=true", collection);
        let _: serde_json::Value = self
            .send(self.client.put(self.url(&path)).json(&json!({ "points": points })))
            .await?;

        debug!(collection, count, "Upserted points");
        Ok(())
    }

    async fn get_by_id(&self, collection: &str, id: &PointId) -> Result<Option<VectorPoint>> {
        let path = format!("/collections/{}/points", collection);
        let body = json!({
            "ids": [id],
            "with_payload": true,
            "with_vector": true,
        });

        let points: Vec<RawPoint> = self.send(self.client.post(self.url(&path)).json(&body)).await?;
        Ok(points.into_iter().next().map(VectorPoint::from))
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<VectorPoint>> {
        let path = format!("/collections/{}/points/scroll", collection);
        let body = json!({
            "filter": { "must": [{ "key": field, "match": { "value": value } }] },
            "limit": 1,
            "with_payload": true,
            "with_vector": true,
        });

        let result: ScrollResult = self.send(self.client.post(self.url(&path)).json(&body)).await?;
        Ok(result.points.into_iter().next().map(VectorPoint::from))
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let path = format!("/collections/{}/points/search", collection);
        let mut body = json!({
            "vector": query,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(threshold) = score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let hits: Vec<RawScoredPoint> =
            self.send(self.client.post(self.url(&path)).json(&body)).await?;

        Ok(hits
            .into_iter()
            .map(|hit| ScoredPoint {
                id: hit.id,
                score: hit.score,
                payload: hit.payload.unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }
}
