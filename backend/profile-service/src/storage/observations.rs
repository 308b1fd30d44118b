use super::{CategoryTag, ObservationStore};
use crate::error::Result;
use crate::models::{BrowsingObservation, DataSource, HistoryObservation};
use crate::services::shard_router::ShardRouter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

/// PostgreSQL observation store, one table per shard and data source.
///
/// Each row keeps the full observation as JSONB next to the columns the
/// queries filter and sort on.
#[derive(Clone)]
pub struct PgObservationStore {
    pool: PgPool,
    router: ShardRouter,
}

impl PgObservationStore {
    pub fn new(pool: PgPool, router: ShardRouter) -> Self {
        Self { pool, router }
    }

    /// Creates every shard table and its indexes
    pub async fn ensure_schema(&self) -> Result<()> {
        for table in self.router.all_collections() {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    url TEXT NOT NULL,
                    visit_count INTEGER NOT NULL DEFAULT 1,
                    saved_at TIMESTAMPTZ NOT NULL,
                    category TEXT,
                    category_score REAL,
                    data JSONB NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_user_saved ON {table} (user_id, saved_at)"
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_user_url ON {table} (user_id, url, saved_at DESC)"
            ))
            .execute(&self.pool)
            .await?;
        }

        info!(shards = self.router.shard_count(), "Observation store schema ready");
        Ok(())
    }
}

#[async_trait]
impl ObservationStore for PgObservationStore {
    async fn save_browsing(
        &self,
        mut observation: BrowsingObservation,
    ) -> Result<BrowsingObservation> {
        let table = self
            .router
            .collection_for(&observation.user_id, DataSource::Browsing);

        let mut tx = self.pool.begin().await?;

        // Serializes concurrent saves of the same (user, url) until commit so
        // each reads the count the previous one wrote
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}:{}", table, observation.user_id, observation.url))
            .execute(&mut *tx)
            .await?;

        let previous: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT MAX(visit_count) FROM {table} WHERE user_id = $1 AND url = $2"
        ))
        .bind(&observation.user_id)
        .bind(&observation.url)
        .fetch_one(&mut *tx)
        .await?;

        observation.visit_count = previous.map(|count| count.max(0) as u32 + 1).unwrap_or(1);

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, user_id, url, visit_count, saved_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#
        ))
        .bind(observation.id)
        .bind(&observation.user_id)
        .bind(&observation.url)
        .bind(observation.visit_count as i32)
        .bind(observation.saved_at)
        .bind(Json(&observation))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            user_id = %observation.user_id,
            table = %table,
            visit_count = observation.visit_count,
            "Saved browsing observation"
        );
        Ok(observation)
    }

    async fn replace_history(
        &self,
        user_id: &str,
        records: Vec<HistoryObservation>,
    ) -> Result<usize> {
        let table = self.router.collection_for(user_id, DataSource::History);
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE user_id = $1"))
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let insert = format!(
            r#"
            INSERT INTO {table} (id, user_id, url, visit_count, saved_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#
        );

        let count = records.len();
        for mut record in records {
            record.user_id = user_id.to_string();
            sqlx::query(&insert)
                .bind(record.id)
                .bind(&record.user_id)
                .bind(&record.url)
                .bind(record.visit_count as i32)
                .bind(record.saved_at)
                .bind(Json(&record))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(
            user_id = %user_id,
            table = %table,
            deleted,
            inserted = count,
            "Replaced history snapshot"
        );
        Ok(count)
    }

    async fn recent_history(&self, user_id: &str, limit: u32) -> Result<Vec<HistoryObservation>> {
        let table = self.router.collection_for(user_id, DataSource::History);

        let rows = sqlx::query(&format!(
            "SELECT data FROM {table} WHERE user_id = $1 ORDER BY saved_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let Json(record): Json<HistoryObservation> = row.try_get("data")?;
                Ok(record)
            })
            .collect()
    }

    async fn browsing_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BrowsingObservation>> {
        let table = self.router.collection_for(user_id, DataSource::Browsing);

        let rows = sqlx::query(&format!(
            "SELECT data FROM {table} WHERE user_id = $1 AND saved_at >= $2 ORDER BY saved_at ASC"
        ))
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let Json(record): Json<BrowsingObservation> = row.try_get("data")?;
                Ok(record)
            })
            .collect()
    }

    async fn tag_categories(
        &self,
        user_id: &str,
        source: DataSource,
        tags: &[CategoryTag],
    ) -> Result<u64> {
        if tags.is_empty() {
            return Ok(0);
        }

        let table = self.router.collection_for(user_id, source);
        let update = format!(
            "UPDATE {table} SET category = $1, category_score = $2 WHERE id = $3 AND user_id = $4"
        );

        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for tag in tags {
            updated += sqlx::query(&update)
                .bind(&tag.category)
                .bind(tag.score)
                .bind(tag.observation_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(user_id = %user_id, table = %table, updated, "Tagged observations");
        Ok(updated)
    }
}
