//! State store trait and an in-memory implementation.
//!
//! A state store keeps exactly one `WorkflowState` document per run ID.
//! The infrastructure layer (conductor-infra) implements the trait on the
//! filesystem; `InMemoryStateStore` backs tests and embedded use.

use std::future::Future;
use std::time::{Duration, Instant};

use conductor_types::state::WorkflowState;
use dashmap::DashMap;
use thiserror::Error;

use crate::workflow::definition::is_valid_identifier;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by state store backends.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("invalid run id '{0}': only [a-zA-Z0-9_-] allowed")]
    InvalidRunId(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Reject run IDs that could escape the store's key space.
pub fn validate_run_id(run_id: &str) -> Result<(), StateStoreError> {
    if is_valid_identifier(run_id) {
        Ok(())
    } else {
        Err(StateStoreError::InvalidRunId(run_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable keyed storage of run state documents.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// A document that exists but cannot be parsed is reported as absent by
/// `load`, never as an error.
pub trait StateStore: Send + Sync {
    /// Insert or replace the document for `state.workflow_id`.
    fn save(&self, state: &WorkflowState)
    -> impl Future<Output = Result<(), StateStoreError>> + Send;

    fn load(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowState>, StateStoreError>> + Send;

    fn has(&self, run_id: &str) -> impl Future<Output = Result<bool, StateStoreError>> + Send;

    /// Returns `true` if a document was removed.
    fn delete(&self, run_id: &str) -> impl Future<Output = Result<bool, StateStoreError>> + Send;

    /// All stored run IDs, sorted.
    fn list(&self) -> impl Future<Output = Result<Vec<String>, StateStoreError>> + Send;

    /// Remove documents last written more than `max_age` ago. Returns the
    /// number of runs removed.
    fn cleanup(
        &self,
        max_age: Duration,
    ) -> impl Future<Output = Result<usize, StateStoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct StoredDocument {
    json: String,
    saved_at: Instant,
}

/// Process-local store. Documents are kept serialized so that loads observe
/// the same round-trip as a durable backend.
#[derive(Default)]
pub struct InMemoryStateStore {
    documents: DashMap<String, StoredDocument>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Store raw text under `run_id`, bypassing serialization.
    pub fn insert_raw(&self, run_id: &str, json: impl Into<String>) {
        self.documents.insert(
            run_id.to_string(),
            StoredDocument {
                json: json.into(),
                saved_at: Instant::now(),
            },
        );
    }

    /// Rewind the save time of a document, for age-based cleanup.
    pub fn backdate(&self, run_id: &str, age: Duration) {
        if let Some(mut doc) = self.documents.get_mut(run_id) {
            if let Some(earlier) = Instant::now().checked_sub(age) {
                doc.saved_at = earlier;
            }
        }
    }
}

impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StateStoreError> {
        validate_run_id(&state.workflow_id)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StateStoreError::Serialization(e.to_string()))?;
        self.insert_raw(&state.workflow_id, json);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, StateStoreError> {
        validate_run_id(run_id)?;
        let Some(doc) = self.documents.get(run_id) else {
            return Ok(None);
        };
        match serde_json::from_str(&doc.json) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(run_id, error = %e, "stored state is corrupt, treating as absent");
                Ok(None)
            }
        }
    }

    async fn has(&self, run_id: &str) -> Result<bool, StateStoreError> {
        validate_run_id(run_id)?;
        Ok(self.documents.contains_key(run_id))
    }

    async fn delete(&self, run_id: &str) -> Result<bool, StateStoreError> {
        validate_run_id(run_id)?;
        Ok(self.documents.remove(run_id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let mut ids: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize, StateStoreError> {
        let before = self.documents.len();
        self.documents
            .retain(|_, doc| doc.saved_at.elapsed() <= max_age);
        let removed = before.saturating_sub(self.documents.len());
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired run states");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::workflow::WorkflowStatus;

    fn state(id: &str) -> WorkflowState {
        WorkflowState::new(id, "flow", vec!["a".to_string()])
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = InMemoryStateStore::new();
        let mut s = state("run-1");
        s.status = WorkflowStatus::Paused;
        store.save(&s).await.unwrap();

        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, s);
        assert!(store.has("run-1").await.unwrap());
        assert!(store.load("run-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_existing_document() {
        let store = InMemoryStateStore::new();
        let mut s = state("run-1");
        store.save(&s).await.unwrap();
        s.status = WorkflowStatus::Completed;
        store.save(&s).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_corrupt_document_loads_as_absent() {
        let store = InMemoryStateStore::new();
        store.insert_raw("broken", "{ not json");
        assert!(store.load("broken").await.unwrap().is_none());
        assert!(store.has("broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_run_id_rejected() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.load("../etc/passwd").await,
            Err(StateStoreError::InvalidRunId(_))
        ));
        assert!(store.save(&state("bad id")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = InMemoryStateStore::new();
        for id in ["run-c", "run-a", "run-b"] {
            store.save(&state(id)).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec!["run-a", "run-b", "run-c"]);
        assert!(store.delete("run-b").await.unwrap());
        assert!(!store.delete("run-b").await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec!["run-a", "run-c"]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = InMemoryStateStore::new();
        store.save(&state("old")).await.unwrap();
        store.save(&state("fresh")).await.unwrap();
        store.backdate("old", Duration::from_millis(150));
        store.backdate("fresh", Duration::from_millis(50));

        let removed = store.cleanup(Duration::from_millis(100)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.has("old").await.unwrap());
        assert!(store.has("fresh").await.unwrap());
    }
}
