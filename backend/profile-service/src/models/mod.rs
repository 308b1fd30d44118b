use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Where an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Live page visit reported while browsing
    Browsing,
    /// Entry from an uploaded browser-history snapshot
    History,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Browsing => "browsing",
            DataSource::History => "history",
        }
    }
}

/// Readable page text extracted client-side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    pub clean_title: String,
    pub clean_content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub word_count: u32,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowsingObservation {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    pub domain: String,
    pub title: String,
    /// Dwell time in seconds
    pub time_spent: u32,
    /// Deepest scroll position reached, percent of page
    pub max_scroll_depth: u32,
    pub visit_count: u32,
    pub content: Option<PageContent>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryObservation {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    pub domain: String,
    pub title: String,
    pub visit_count: u32,
    /// Visits where the URL was typed into the address bar
    pub typed_count: u32,
    #[serde(default)]
    pub total_visits: u32,
    #[serde(default)]
    pub direct_visits: u32,
    pub last_visit_time: Option<DateTime<Utc>>,
    pub content: Option<PageContent>,
    pub saved_at: DateTime<Utc>,
}

/// Behavioral signals consumed by the weight model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightInputs {
    pub source: DataSource,
    pub time_spent_secs: f64,
    pub scroll_depth_pct: f64,
    pub visit_count: u32,
    pub typed_count: u32,
}

/// Capability shared by every kind of observation
pub trait Observed {
    fn id(&self) -> Uuid;
    fn user_id(&self) -> &str;
    fn url(&self) -> &str;
    fn domain(&self) -> &str;
    fn title(&self) -> &str;
    fn data_source(&self) -> DataSource;
    fn content(&self) -> Option<&PageContent>;
    fn visit_count(&self) -> u32;
    fn saved_at(&self) -> DateTime<Utc>;
    fn weight_inputs(&self) -> WeightInputs;

    /// `"{title} {content}"` with content truncated to `max_chars` characters,
    /// falling back to whichever part is present. `None` when nothing is left
    /// after trimming.
    fn text_for_embedding(&self, max_chars: usize) -> Option<String> {
        let content = self.content()?;
        let title = content.clean_title.trim();
        let body: String = content.clean_content.chars().take(max_chars).collect();
        let body = body.trim();

        let combined = match (title.is_empty(), body.is_empty()) {
            (false, false) => format!("{} {}", title, body),
            (false, true) => title.to_string(),
            (true, false) => body.to_string(),
            (true, true) => return None,
        };

        Some(combined)
    }

    fn url_hash(&self) -> String {
        url_hash(self.url())
    }

    /// Title shown in logs: the cleaned title when available
    fn display_title(&self) -> &str {
        self.content()
            .map(|c| c.clean_title.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.title())
    }
}

impl Observed for BrowsingObservation {
    fn id(&self) -> Uuid {
        self.id
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn url(&self) -> &str {
        &self.url
    }
    fn domain(&self) -> &str {
        &self.domain
    }
    fn title(&self) -> &str {
        &self.title
    }
    fn data_source(&self) -> DataSource {
        DataSource::Browsing
    }
    fn content(&self) -> Option<&PageContent> {
        self.content.as_ref()
    }
    fn visit_count(&self) -> u32 {
        self.visit_count
    }
    fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
    }

    fn weight_inputs(&self) -> WeightInputs {
        WeightInputs {
            source: DataSource::Browsing,
            time_spent_secs: self.time_spent as f64,
            scroll_depth_pct: self.max_scroll_depth as f64,
            visit_count: self.visit_count,
            typed_count: 0,
        }
    }
}

impl Observed for HistoryObservation {
    fn id(&self) -> Uuid {
        self.id
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn url(&self) -> &str {
        &self.url
    }
    fn domain(&self) -> &str {
        &self.domain
    }
    fn title(&self) -> &str {
        &self.title
    }
    fn data_source(&self) -> DataSource {
        DataSource::History
    }
    fn content(&self) -> Option<&PageContent> {
        self.content.as_ref()
    }
    fn visit_count(&self) -> u32 {
        self.visit_count
    }
    fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
    }

    // History entries carry no dwell or scroll signal
    fn weight_inputs(&self) -> WeightInputs {
        WeightInputs {
            source: DataSource::History,
            time_spent_secs: 0.0,
            scroll_depth_pct: 0.0,
            visit_count: self.visit_count,
            typed_count: self.typed_count,
        }
    }
}

/// Hex SHA-256 of the URL; idempotency key of the URL-keyed log
pub fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Namespace for deterministic point ids in the vector store
const POINT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_4b7d_4e0a_9c35_d1f2_7a60_b9e4);

/// Point id of a user's profile
pub fn profile_point_id(user_id: &str) -> Uuid {
    Uuid::new_v5(&POINT_NAMESPACE, user_id.as_bytes())
}

/// Point id of a log entry; the same URL for the same user always maps here
pub fn log_point_id(user_id: &str, url_hash: &str) -> Uuid {
    Uuid::new_v5(&POINT_NAMESPACE, format!("{}:{}", user_id, url_hash).as_bytes())
}

/// Latest known vector for one URL of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub user_id: String,
    pub url: String,
    pub url_hash: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub weight: f64,
    pub domain: String,
    pub title: String,
    pub data_source: DataSource,
    pub visit_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typed_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_score: Option<f32>,
    pub saved_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn from_observation(obs: &dyn Observed, vector: Vec<f32>, weight: f64) -> Self {
        let inputs = obs.weight_inputs();
        let (typed_count, time_spent, scroll_depth) = match obs.data_source() {
            DataSource::History => (Some(inputs.typed_count), None, None),
            DataSource::Browsing => (
                None,
                Some(inputs.time_spent_secs as u32),
                Some(inputs.scroll_depth_pct as u32),
            ),
        };

        Self {
            user_id: obs.user_id().to_string(),
            url: obs.url().to_string(),
            url_hash: obs.url_hash(),
            vector,
            weight,
            domain: obs.domain().to_string(),
            title: obs.display_title().to_string(),
            data_source: obs.data_source(),
            visit_count: obs.visit_count(),
            typed_count,
            time_spent,
            scroll_depth,
            category: None,
            category_score: None,
            saved_at: obs.saved_at(),
        }
    }

    pub fn point_id(&self) -> Uuid {
        log_point_id(&self.user_id, &self.url_hash)
    }
}

/// How a profile was first produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    HistoryData,
    Rebuild,
}

fn default_mean_norm() -> f64 {
    1.0
}

/// Aggregate interest vector of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    /// Unit-normalized profile vector
    #[serde(skip)]
    pub vector: Vec<f32>,
    /// Total weight folded in so far; never decreases
    pub weight_sum: f64,
    /// Norm of the weighted mean before normalization
    #[serde(default = "default_mean_norm")]
    pub mean_norm: f64,
    pub log_count: u64,
    pub avg_weight: f64,
    pub max_weight: f64,
    pub min_weight: f64,
    pub created_from: ProfileSource,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl UserProfile {
    pub fn point_id(&self) -> Uuid {
        profile_point_id(&self.user_id)
    }
}

/// Round to 3 decimal places
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
