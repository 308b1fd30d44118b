use crate::{
    validate_user_id, AdmissionResult, ProcessingState, ProcessingStateError,
    ProcessingStateResult, ProcessingStateStore,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Admission retries when the competing record disappears between the
/// conditional insert and the follow-up read
const MAX_ADMISSION_ATTEMPTS: usize = 3;

/// PostgreSQL-backed processing state store.
///
/// The uniqueness constraint on `user_id` enforces a single live record per
/// user. Expiry is evaluated against database time so that workers with
/// skewed clocks agree on it.
#[derive(Clone)]
pub struct PgProcessingStateStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgProcessingStateStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Create the `processing_history` table and its expiry index if missing
    pub async fn ensure_schema(&self) -> ProcessingStateResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processing_history (
                user_id       TEXT PRIMARY KEY,
                is_processing BOOLEAN NOT NULL DEFAULT TRUE,
                started_at    TIMESTAMPTZ NOT NULL,
                expires_at    TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create processing_history table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_processing_history_expires_at
                ON processing_history (expires_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create processing_history expiry index")?;

        Ok(())
    }

    fn row_to_state(row: &PgRow) -> ProcessingStateResult<ProcessingState> {
        Ok(ProcessingState {
            user_id: row.try_get("user_id")?,
            is_processing: row.try_get("is_processing")?,
            started_at: row.try_get("started_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl ProcessingStateStore for PgProcessingStateStore {
    async fn try_start(&self, user_id: &str) -> ProcessingStateResult<AdmissionResult> {
        validate_user_id(user_id)?;

        let timeout_secs = self.timeout.as_secs_f64();

        for attempt in 1..=MAX_ADMISSION_ATTEMPTS {
            // A conflicting row is only overwritten when it has already expired,
            // which makes TTL reclaim part of the same atomic statement.
            let inserted = sqlx::query(
                r#"
                INSERT INTO processing_history (user_id, is_processing, started_at, expires_at)
                VALUES ($1, TRUE, NOW(), NOW() + make_interval(secs => $2))
                ON CONFLICT (user_id) DO UPDATE
                    SET is_processing = TRUE,
                        started_at = EXCLUDED.started_at,
                        expires_at = EXCLUDED.expires_at
                    WHERE processing_history.expires_at <= NOW()
                RETURNING user_id, is_processing, started_at, expires_at
                "#,
            )
            .bind(user_id)
            .bind(timeout_secs)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to record processing start")?;

            if let Some(row) = inserted {
                let state = Self::row_to_state(&row)?;
                info!(
                    user_id = %user_id,
                    started_at = %state.started_at,
                    expires_at = %state.expires_at,
                    "Processing started"
                );
                return Ok(AdmissionResult::Started(state));
            }

            if let Some(existing) = self.get(user_id).await? {
                debug!(
                    user_id = %user_id,
                    started_at = %existing.started_at,
                    "Processing already in flight"
                );
                return Ok(AdmissionResult::AlreadyProcessing(existing));
            }

            debug!(user_id = %user_id, attempt, "Competing record vanished, retrying admission");
        }

        Err(ProcessingStateError::Contention(user_id.to_string()))
    }

    async fn finish(
        &self,
        user_id: &str,
        started_at: DateTime<Utc>,
    ) -> ProcessingStateResult<bool> {
        validate_user_id(user_id)?;

        let result = sqlx::query(
            r#"
            DELETE FROM processing_history
            WHERE user_id = $1 AND started_at = $2
            "#,
        )
        .bind(user_id)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .context("Failed to record processing finish")?;

        let released = result.rows_affected() > 0;
        if released {
            info!(user_id = %user_id, started_at = %started_at, "Processing finished");
        } else {
            warn!(
                user_id = %user_id,
                started_at = %started_at,
                "Processing record already gone or replaced"
            );
        }

        Ok(released)
    }

    async fn get(&self, user_id: &str) -> ProcessingStateResult<Option<ProcessingState>> {
        validate_user_id(user_id)?;

        let row = sqlx::query(
            r#"
            SELECT user_id, is_processing, started_at, expires_at
            FROM processing_history
            WHERE user_id = $1 AND is_processing AND expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read processing state")?;

        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn cleanup_expired(&self) -> ProcessingStateResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processing_history
            WHERE expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to cleanup expired processing states")?;

        let deleted_count = result.rows_affected();

        if deleted_count > 0 {
            info!(deleted_count, "Cleaned up expired processing states");
        } else {
            debug!("No expired processing states to cleanup");
        }

        Ok(deleted_count)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
