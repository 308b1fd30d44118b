//! # Processing State Library
//!
//! Per-user admission control for long-running profile (re)builds, persisted so
//! that it holds across processes and machines.
//!
//! ## Problem
//!
//! A bulk profile build for one user reads hundreds of history records, embeds
//! them and commits a single aggregate. If two builds for the same user run at
//! once (duplicate upload, retry storm, two workers picking the same job) they
//! race on the profile and double-count weight. An in-memory mutex cannot help
//! because the builds may run in different processes.
//!
//! ## Solution
//!
//! One `processing_history` record per user, unique on `user_id`:
//! - **Admission**: creating the record either succeeds (you own the build) or
//!   observes a live record (`AlreadyProcessing`). Callers never block.
//! - **Completion**: the owner deletes the record by `(user_id, started_at)`.
//!   A build that outlived its TTL cannot delete the record of a build
//!   admitted after it.
//! - **TTL backstop**: every record carries `expires_at`. An expired record is
//!   treated as absent by admission and is removed by `cleanup_expired`, so a
//!   crashed worker cannot lock a user out forever.
//!
//! ## Architecture
//!
//! ```text
//! start(user) ──► INSERT .. ON CONFLICT (user_id) DO UPDATE .. WHERE expired
//!                     │ row returned ─► Started
//!                     └ no row      ─► AlreadyProcessing
//! finish(user, started_at) ─► DELETE .. WHERE started_at = $2
//! sweeper      ─► DELETE .. WHERE expires_at <= NOW()
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use processing_state::{AdmissionResult, PgProcessingStateStore, ProcessingStateStore};
//! use std::time::Duration;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgProcessingStateStore::new(pool, Duration::from_secs(20 * 60));
//!
//! match store.try_start("user-1").await? {
//!     AdmissionResult::Started(state) => {
//!         // run the bulk build ...
//!         if !store.finish("user-1", state.started_at).await? {
//!             // expired and taken over by a later build
//!         }
//!         // replay observations saved in [started_at, expires_at) ...
//!     }
//!     AdmissionResult::AlreadyProcessing(state) => {
//!         println!("busy until {}", state.expires_at);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Safety
//!
//! - **10 workers start the same user**: exactly one gets `Started`, the other
//!   nine get `AlreadyProcessing` (unique constraint, single statement).
//! - **Worker crash**: the record outlives the worker until `expires_at`; the
//!   next `try_start` after that reclaims it in the same statement.
//! - Partial side effects of a crashed build are not rolled back here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod error;
mod memory;
mod postgres;

pub use error::{ProcessingStateError, ProcessingStateResult};
pub use memory::InMemoryProcessingStateStore;
pub use postgres::PgProcessingStateStore;

/// Default build timeout before a record is considered abandoned (20 minutes)
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Maximum accepted user id length
pub const MAX_USER_ID_LEN: usize = 255;

/// Persisted marker that a bulk build is in flight for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    /// Unique per live record
    pub user_id: String,

    /// Always true for a stored record; kept for schema compatibility
    pub is_processing: bool,

    /// When the owning build was admitted
    pub started_at: DateTime<Utc>,

    /// `started_at` + timeout; after this the record no longer blocks admission
    pub expires_at: DateTime<Utc>,
}

impl ProcessingState {
    pub fn new(
        user_id: impl Into<String>,
        started_at: DateTime<Utc>,
        timeout: Duration,
    ) -> ProcessingStateResult<Self> {
        let ttl = chrono::Duration::from_std(timeout).map_err(|e| {
            ProcessingStateError::Other(anyhow::anyhow!("Invalid processing timeout: {}", e))
        })?;

        Ok(Self {
            user_id: user_id.into(),
            is_processing: true,
            started_at,
            expires_at: started_at + ttl,
        })
    }

    /// A record whose `expires_at` has passed is treated as absent
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_processing && !self.is_expired_at(now)
    }
}

/// Outcome of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    /// Caller owns the build and must call `finish` when done
    Started(ProcessingState),

    /// A live build already exists; caller should decline and retry later
    AlreadyProcessing(ProcessingState),
}

impl AdmissionResult {
    pub fn is_started(&self) -> bool {
        matches!(self, AdmissionResult::Started(_))
    }

    pub fn state(&self) -> &ProcessingState {
        match self {
            AdmissionResult::Started(state) | AdmissionResult::AlreadyProcessing(state) => state,
        }
    }
}

/// Storage for per-user processing records.
///
/// Implementations must make `try_start` atomic with respect to other callers
/// of the same store, including callers in other processes for persistent
/// backends. Store unavailability is always returned as an error.
#[async_trait]
pub trait ProcessingStateStore: Send + Sync {
    /// Attempt to create a live record for `user_id`
    async fn try_start(&self, user_id: &str) -> ProcessingStateResult<AdmissionResult>;

    /// Delete the record admitted at `started_at`. Returns `false` when there
    /// is no such record, including when a later admission has replaced it.
    async fn finish(&self, user_id: &str, started_at: DateTime<Utc>)
        -> ProcessingStateResult<bool>;

    /// Live (unexpired) record for `user_id`
    async fn get(&self, user_id: &str) -> ProcessingStateResult<Option<ProcessingState>>;

    /// Remove expired records, returning how many were deleted
    async fn cleanup_expired(&self) -> ProcessingStateResult<u64>;

    /// Build timeout applied to new records
    fn timeout(&self) -> Duration;

    async fn is_processing(&self, user_id: &str) -> ProcessingStateResult<bool> {
        Ok(self.get(user_id).await?.is_some())
    }
}

pub(crate) fn validate_user_id(user_id: &str) -> ProcessingStateResult<()> {
    if user_id.is_empty() {
        return Err(ProcessingStateError::InvalidUserId(
            "User ID cannot be empty".to_string(),
        ));
    }

    if user_id.len() > MAX_USER_ID_LEN {
        return Err(ProcessingStateError::InvalidUserId(format!(
            "User ID too long: {} characters (max {})",
            user_id.len(),
            MAX_USER_ID_LEN
        )));
    }

    Ok(())
}
