// ============================================
// Category Classifier
// ============================================
//
// Tags observation vectors with the closest of a fixed set of reference
// categories by cosine similarity. The reference vectors are embedded once
// (setup-categories mode) and stored as integer-id points in the log
// collection; every process loads them at startup and treats them as
// read-only afterwards.

mod categories;

pub use categories::{CategoryDef, CATEGORIES};

use crate::error::{AppError, Result};
use crate::models::round3;
use crate::storage::{EmbeddingProvider, PointId, VectorPoint, VectorStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

/// Marker stored in `data_source` of reference points
pub const CATEGORY_DATA_SOURCE: &str = "category";

/// One reference category with its embedding
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryVector {
    pub id: u64,
    pub name: String,
    pub vector: Vec<f32>,
}

/// Best-matching category for one vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub category: String,
    /// Cosine similarity rounded to 3 decimals
    pub score: f32,
}

/// Result of checking which reference points exist
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryVerification {
    pub total: usize,
    pub found: usize,
    pub missing: Vec<String>,
}

impl CategoryVerification {
    pub fn is_complete(&self) -> bool {
        self.found == self.total
    }
}

#[derive(Debug, Clone, Default)]
pub struct CategoryClassifier {
    /// Kept in ascending id order; ties resolve to the earliest entry
    categories: Vec<CategoryVector>,
}

impl CategoryClassifier {
    pub fn new(mut categories: Vec<CategoryVector>) -> Self {
        categories.sort_by_key(|c| c.id);
        Self { categories }
    }

    /// Classifier with no reference set; every `classify` returns `None`
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    /// Argmax of cosine similarity over the reference set
    pub fn classify(&self, vector: &[f32]) -> Option<CategoryAssignment> {
        let mut best: Option<(&CategoryVector, f32)> = None;

        for category in &self.categories {
            let score = cosine_similarity(vector, &category.vector);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((category, score)),
            }
        }

        best.map(|(category, score)| CategoryAssignment {
            category: category.name.clone(),
            score: round3(score as f64) as f32,
        })
    }

    /// Classifies each vector and logs the per-category counts of the batch
    pub fn classify_batch(&self, vectors: &[Vec<f32>]) -> Vec<Option<CategoryAssignment>> {
        if self.is_empty() {
            warn!(
                count = vectors.len(),
                "No category vectors loaded; skipping classification"
            );
            return vec![None; vectors.len()];
        }

        let assignments: Vec<Option<CategoryAssignment>> =
            vectors.iter().map(|v| self.classify(v)).collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for assignment in assignments.iter().flatten() {
            *counts.entry(assignment.category.as_str()).or_default() += 1;
        }
        let mut stats: Vec<(&str, usize)> = counts.into_iter().collect();
        stats.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        info!(classified = assignments.len(), stats = ?stats, "Category statistics");
        assignments
    }

    /// Reads the reference points back from the vector store. Missing points
    /// are skipped with a warning.
    pub async fn load(store: &dyn VectorStore, collection: &str) -> Result<Self> {
        let mut categories = Vec::with_capacity(CATEGORIES.len());

        for (id, def) in CATEGORIES.iter().enumerate() {
            let id = id as u64;
            match store.get_by_id(collection, &PointId::Num(id)).await? {
                Some(point) if !point.vector.is_empty() => categories.push(CategoryVector {
                    id,
                    name: def.name.to_string(),
                    vector: point.vector,
                }),
                _ => warn!(category = def.name, id, "Category vector missing"),
            }
        }

        info!(loaded = categories.len(), "Loaded category vectors");
        Ok(Self::new(categories))
    }

    /// Embeds `"{name} {description}"` for every category and stores the
    /// reference points under ids `0..CATEGORIES.len()`.
    pub async fn seed(
        store: &dyn VectorStore,
        embedder: &dyn EmbeddingProvider,
        collection: &str,
    ) -> Result<usize> {
        store
            .ensure_collection(collection, embedder.dimension())
            .await?;

        let texts: Vec<String> = CATEGORIES
            .iter()
            .map(|def| format!("{} {}", def.name, def.description))
            .collect();

        let vectors = embedder.encode_batch(&texts).await?;
        if vectors.len() != CATEGORIES.len() {
            return Err(AppError::Embedding(format!(
                "Expected {} category vectors, got {}",
                CATEGORIES.len(),
                vectors.len()
            )));
        }

        let points: Vec<VectorPoint> = CATEGORIES
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(id, (def, vector))| VectorPoint {
                id: PointId::Num(id as u64),
                vector,
                payload: json!({
                    "category_name": def.name,
                    "category_id": id,
                    "data_source": CATEGORY_DATA_SOURCE,
                    "description": def.description,
                    "is_reference": true,
                }),
            })
            .collect();

        let count = points.len();
        store.upsert(collection, points).await?;

        info!(collection, count, "Seeded category vectors");
        Ok(count)
    }

    /// Checks that every reference point is present
    pub async fn verify(store: &dyn VectorStore, collection: &str) -> Result<CategoryVerification> {
        let mut missing = Vec::new();

        for (id, def) in CATEGORIES.iter().enumerate() {
            let point = store.get_by_id(collection, &PointId::Num(id as u64)).await?;
            if point.map_or(true, |p| p.vector.is_empty()) {
                missing.push(def.name.to_string());
            }
        }

        Ok(CategoryVerification {
            total: CATEGORIES.len(),
            found: CATEGORIES.len() - missing.len(),
            missing,
        })
    }
}

/// Cosine similarity; 0.0 when either side has zero norm or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryVectorStore, MockEmbeddingProvider};

    fn classifier() -> CategoryClassifier {
        CategoryClassifier::new(vec![
            CategoryVector {
                id: 2,
                name: "Economy".to_string(),
                vector: vec![0.0, 1.0],
            },
            CategoryVector {
                id: 0,
                name: "Politics".to_string(),
                vector: vec![1.0, 0.0],
            },
            CategoryVector {
                id: 1,
                name: "Society".to_string(),
                vector: vec![1.0, 0.0],
            },
        ])
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_classify_picks_argmax() {
        let result = classifier().classify(&[0.1, 0.9]).unwrap();
        assert_eq!(result.category, "Economy");
        assert!(result.score > 0.9);
    }

    #[test]
    fn test_ties_go_to_first_category() {
        // Politics and Society share a vector; Politics has the lower id
        let result = classifier().classify(&[1.0, 0.0]).unwrap();
        assert_eq!(result.category, "Politics");
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn test_score_is_rounded() {
        let result = classifier().classify(&[1.0, 2.0]).unwrap();
        // 2 / sqrt(5) = 0.89442...
        assert_eq!(result.category, "Economy");
        assert_eq!(result.score, 0.894);
    }

    #[test]
    fn test_empty_classifier_returns_none() {
        let classifier = CategoryClassifier::empty();
        assert!(classifier.classify(&[1.0, 0.0]).is_none());
        assert_eq!(
            classifier.classify_batch(&[vec![1.0, 0.0], vec![0.0, 1.0]]),
            vec![None, None]
        );
    }

    #[test]
    fn test_fixed_reference_set() {
        assert_eq!(CATEGORIES.len(), 17);
        assert_eq!(CATEGORIES[0].name, "Politics");
        assert_eq!(CATEGORIES[16].name, "Philosophy");
        assert!(CATEGORIES.iter().all(|c| !c.description.is_empty()));
    }

    #[tokio::test]
    async fn test_seed_then_load_round_trip() {
        let store = InMemoryVectorStore::new();
        let mut embedder = MockEmbeddingProvider::new();
        embedder.expect_dimension().return_const(17usize);
        embedder.expect_encode_batch().returning(|texts| {
            // One-hot vector per category
            Ok((0..texts.len())
                .map(|i| {
                    let mut v = vec![0.0; texts.len()];
                    v[i] = 1.0;
                    v
                })
                .collect())
        });

        let seeded = CategoryClassifier::seed(&store, &embedder, "user_logs")
            .await
            .unwrap();
        assert_eq!(seeded, 17);

        let point = store
            .get_by_id("user_logs", &PointId::Num(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(point.payload["category_name"], "Technology");
        assert_eq!(point.payload["is_reference"], true);
        assert_eq!(point.payload["data_source"], "category");

        let classifier = CategoryClassifier::load(&store, "user_logs").await.unwrap();
        assert_eq!(classifier.len(), 17);

        let mut query = vec![0.0; 17];
        query[9] = 1.0;
        assert_eq!(classifier.classify(&query).unwrap().category, "Sports");

        let verification = CategoryClassifier::verify(&store, "user_logs").await.unwrap();
        assert!(verification.is_complete());
    }

    #[tokio::test]
    async fn test_load_skips_missing_points() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "user_logs",
                vec![VectorPoint {
                    id: PointId::Num(4),
                    vector: vec![1.0, 0.0],
                    payload: json!({ "category_name": "Science" }),
                }],
            )
            .await
            .unwrap();

        let classifier = CategoryClassifier::load(&store, "user_logs").await.unwrap();
        assert_eq!(classifier.len(), 1);
        assert_eq!(classifier.classify(&[0.5, 0.5]).unwrap().category, "Science");

        let verification = CategoryClassifier::verify(&store, "user_logs").await.unwrap();
        assert_eq!(verification.found, 1);
        assert_eq!(verification.missing.len(), 16);
    }

    #[tokio::test]
    async fn test_seed_fails_when_provider_fails() {
        let store = InMemoryVectorStore::new();
        let mut embedder = MockEmbeddingProvider::new();
        embedder.expect_dimension().return_const(8usize);
        embedder
            .expect_encode_batch()
            .returning(|_| Err(AppError::Embedding("provider down".to_string())));

        let result = CategoryClassifier::seed(&store, &embedder, "user_logs").await;
        assert!(matches!(result, Err(AppError::Embedding(_))));
        assert_eq!(store.len("user_logs").await, 0);
    }
}
