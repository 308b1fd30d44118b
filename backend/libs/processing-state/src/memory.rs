use crate::{
    validate_user_id, AdmissionResult, ProcessingState, ProcessingStateResult,
    ProcessingStateStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Single-process store for tests and local development.
///
/// Gives the same admission semantics as the PostgreSQL store within one
/// process; it offers no protection across processes.
pub struct InMemoryProcessingStateStore {
    states: Mutex<HashMap<String, ProcessingState>>,
    timeout: Duration,
}

impl InMemoryProcessingStateStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Number of stored records, expired ones included
    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }
}

impl Default for InMemoryProcessingStateStore {
    fn default() -> Self {
        Self::new(crate::DEFAULT_PROCESSING_TIMEOUT)
    }
}

#[async_trait]
impl ProcessingStateStore for InMemoryProcessingStateStore {
    async fn try_start(&self, user_id: &str) -> ProcessingStateResult<AdmissionResult> {
        validate_user_id(user_id)?;

        let now = Utc::now();
        let mut states = self.states.lock().await;

        if let Some(existing) = states.get(user_id) {
            if existing.is_live_at(now) {
                debug!(user_id = %user_id, "Processing already in flight");
                return Ok(AdmissionResult::AlreadyProcessing(existing.clone()));
            }
        }

        let state = ProcessingState::new(user_id, now, self.timeout)?;
        states.insert(user_id.to_string(), state.clone());

        info!(user_id = %user_id, started_at = %state.started_at, "Processing started");

        Ok(AdmissionResult::Started(state))
    }

    async fn finish(
        &self,
        user_id: &str,
        started_at: DateTime<Utc>,
    ) -> ProcessingStateResult<bool> {
        validate_user_id(user_id)?;

        let mut states = self.states.lock().await;
        let owned = states
            .get(user_id)
            .is_some_and(|state| state.started_at == started_at);

        if owned {
            states.remove(user_id);
            info!(user_id = %user_id, started_at = %started_at, "Processing finished");
        } else {
            warn!(
                user_id = %user_id,
                started_at = %started_at,
                "Processing record already gone or replaced"
            );
        }

        Ok(owned)
    }

    async fn get(&self, user_id: &str) -> ProcessingStateResult<Option<ProcessingState>> {
        validate_user_id(user_id)?;

        let now = Utc::now();
        Ok(self
            .states
            .lock()
            .await
            .get(user_id)
            .filter(|state| state.is_live_at(now))
            .cloned())
    }

    async fn cleanup_expired(&self) -> ProcessingStateResult<u64> {
        let now = Utc::now();
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, state| !state.is_expired_at(now));
        let deleted_count = (before - states.len()) as u64;

        if deleted_count > 0 {
            info!(deleted_count, "Cleaned up expired processing states");
        }

        Ok(deleted_count)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_without_start_releases_nothing() {
        let store = InMemoryProcessingStateStore::default();
        assert!(!store.finish("nobody", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_with_foreign_started_at_keeps_record() {
        let store = InMemoryProcessingStateStore::default();
        let state = store.try_start("u1").await.unwrap().state().clone();

        let stale = state.started_at - chrono::Duration::seconds(1);
        assert!(!store.finish("u1", stale).await.unwrap());
        assert!(store.is_processing("u1").await.unwrap());

        assert!(store.finish("u1", state.started_at).await.unwrap());
        assert!(!store.is_processing("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_user_id_rejected() {
        let store = InMemoryProcessingStateStore::default();
        assert!(store.try_start("").await.is_err());
    }
}
