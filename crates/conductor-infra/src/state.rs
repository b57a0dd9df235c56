//! Filesystem implementation of `StateStore`.
//!
//! Each run is one pretty-printed JSON document `<run-id>.json` in the state
//! directory. Writes go to a temporary file that is then renamed over the
//! document, so a crash never leaves a half-written state behind. Before
//! each overwrite the previous document is rotated into
//! `<run-id>.json.bak.1 .. bak.N`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use conductor_core::state::{StateStore, StateStoreError, validate_run_id};
use conductor_types::state::WorkflowState;

const DOCUMENT_EXT: &str = ".json";

/// Stores run state under a directory, one file per run.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    dir: PathBuf,
    max_backups: usize,
}

impl FsStateStore {
    pub fn new(dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            dir: dir.into(),
            max_backups,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the primary document for `run_id`.
    pub fn document_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}{DOCUMENT_EXT}"))
    }

    /// Path of backup number `n` (1 is the most recent).
    pub fn backup_path(&self, run_id: &str, n: usize) -> PathBuf {
        self.dir.join(format!("{run_id}{DOCUMENT_EXT}.bak.{n}"))
    }

    /// Shift existing backups up by one and copy the current document into
    /// slot 1. Failures only cost history, so they are logged and ignored.
    async fn rotate_backups(&self, run_id: &str) {
        if self.max_backups == 0 {
            return;
        }
        let primary = self.document_path(run_id);
        if !tokio::fs::try_exists(&primary).await.unwrap_or(false) {
            return;
        }

        for n in (1..self.max_backups).rev() {
            let from = self.backup_path(run_id, n);
            match tokio::fs::rename(&from, self.backup_path(run_id, n + 1)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(run_id, backup = n, error = %e, "failed to rotate state backup");
                }
            }
        }
        if let Err(e) = tokio::fs::copy(&primary, self.backup_path(run_id, 1)).await {
            tracing::warn!(run_id, error = %e, "failed to back up state document");
        }
    }

    async fn remove_backups(&self, run_id: &str) {
        for n in 1..=self.max_backups.max(1) {
            match tokio::fs::remove_file(self.backup_path(run_id, n)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(run_id, backup = n, error = %e, "failed to remove backup"),
            }
        }
    }

    /// Load a backup document, for manual recovery of a corrupted run.
    pub async fn load_backup(
        &self,
        run_id: &str,
        n: usize,
    ) -> Result<Option<WorkflowState>, StateStoreError> {
        validate_run_id(run_id)?;
        read_document(&self.backup_path(run_id, n)).await
    }

    /// Remove backups whose primary document is gone, plus temp files left
    /// by interrupted writes, once they are older than `max_age`.
    async fn sweep_orphans(&self, now: SystemTime, max_age: Duration) -> Result<usize, StateStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut swept = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let orphaned = match backup_owner(name) {
                Some(run_id) => !tokio::fs::try_exists(self.document_path(run_id)).await?,
                None => name.starts_with('.') && name.ends_with(".tmp"),
            };
            if !orphaned {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if now.duration_since(modified).unwrap_or_default() <= max_age {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => swept += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if swept > 0 {
            tracing::info!(swept, "removed orphaned state files");
        }
        Ok(swept)
    }

    async fn modified(&self, run_id: &str) -> Result<Option<SystemTime>, StateStoreError> {
        match tokio::fs::metadata(self.document_path(run_id)).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run ID of a `<run-id>.json.bak.<n>` file name.
fn backup_owner(name: &str) -> Option<&str> {
    let (document, n) = name.rsplit_once(".bak.")?;
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let run_id = document.strip_suffix(DOCUMENT_EXT)?;
    validate_run_id(run_id).ok().map(|()| run_id)
}

/// Read and parse a document. Missing or unparseable documents are `None`.
async fn read_document(path: &Path) -> Result<Option<WorkflowState>, StateStoreError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<WorkflowState>(&content) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupted state document");
            Ok(None)
        }
    }
}

impl StateStore for FsStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StateStoreError> {
        let run_id = state.workflow_id.as_str();
        validate_run_id(run_id)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StateStoreError::Serialization(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        self.rotate_backups(run_id).await;

        let tmp = self
            .dir
            .join(format!(".{run_id}{DOCUMENT_EXT}.{}.tmp", uuid::Uuid::now_v7()));
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, self.document_path(run_id)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(run_id, status = %state.status, "saved run state");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, StateStoreError> {
        validate_run_id(run_id)?;
        read_document(&self.document_path(run_id)).await
    }

    async fn has(&self, run_id: &str) -> Result<bool, StateStoreError> {
        validate_run_id(run_id)?;
        Ok(tokio::fs::try_exists(self.document_path(run_id)).await?)
    }

    async fn delete(&self, run_id: &str) -> Result<bool, StateStoreError> {
        validate_run_id(run_id)?;
        let removed = match tokio::fs::remove_file(self.document_path(run_id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        self.remove_backups(run_id).await;
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(DOCUMENT_EXT)) else {
                continue;
            };
            if validate_run_id(id).is_ok() {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize, StateStoreError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for run_id in self.list().await? {
            let Some(modified) = self.modified(&run_id).await? else {
                continue;
            };
            // Clock skew can put mtimes in the future; those are fresh.
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age && self.delete(&run_id).await? {
                tracing::info!(run_id = run_id.as_str(), age_ms = age.as_millis() as u64, "removed expired run state");
                removed += 1;
            }
        }
        self.sweep_orphans(now, max_age).await?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::state::StepState;
    use conductor_types::workflow::{StepResult, StepStatus, WorkflowStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn state(run_id: &str) -> WorkflowState {
        WorkflowState::new(run_id, "deploy", vec!["build".into(), "test".into()])
    }

    fn set_age(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_save_load_round_trip_preserves_dates() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 3);

        let mut original = state("run-1");
        original.status = WorkflowStatus::Failed;
        original.execution_metadata.started_at = Some(chrono::Utc::now());
        original.step_states.insert(
            "build".into(),
            StepState {
                status: StepStatus::Completed,
                result: Some(StepResult::succeeded(json!({"artifact": "app.tar"}), 42)),
                skip_reason: None,
            },
        );
        store.save(&original).await.unwrap();

        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(store.has("run-1").await.unwrap());
        assert!(!store.has("run-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_backups_rotate_and_are_bounded() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 2);
        let mut doc = state("rot");

        for resume_count in 0..4 {
            doc.resume_count = resume_count;
            store.save(&doc).await.unwrap();
        }

        assert_eq!(store.load("rot").await.unwrap().unwrap().resume_count, 3);
        assert_eq!(store.load_backup("rot", 1).await.unwrap().unwrap().resume_count, 2);
        assert_eq!(store.load_backup("rot", 2).await.unwrap().unwrap().resume_count, 1);
        assert!(!store.backup_path("rot", 3).exists());
    }

    #[tokio::test]
    async fn test_corrupted_document_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 1);
        tokio::fs::write(store.document_path("bad"), "{ not json").await.unwrap();
        assert!(store.load("bad").await.unwrap().is_none());
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_ids_cannot_escape_directory() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path().join("state"), 1);
        for id in ["../evil", "a/b", "", "x.json"] {
            assert!(matches!(
                store.load(id).await,
                Err(StateStoreError::InvalidRunId(_))
            ));
        }
        assert!(store.save(&state("../../etc")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 2);
        assert!(store.list().await.unwrap().is_empty());

        store.save(&state("b-run")).await.unwrap();
        store.save(&state("a-run")).await.unwrap();
        store.save(&state("a-run")).await.unwrap();
        tokio::fs::write(tmp.path().join("notes.txt"), "x").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a-run", "b-run"]);
        assert!(store.delete("a-run").await.unwrap());
        assert!(!store.backup_path("a-run", 1).exists());
        assert!(!store.delete("a-run").await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec!["b-run"]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_documents() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 1);
        store.save(&state("old")).await.unwrap();
        store.save(&state("fresh")).await.unwrap();
        set_age(&store.document_path("old"), Duration::from_millis(150));
        set_age(&store.document_path("fresh"), Duration::from_millis(50));

        let removed = store.cleanup(Duration::from_millis(100)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.load("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_orphaned_backups() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 2);
        for id in ["gone", "kept"] {
            store.save(&state(id)).await.unwrap();
            store.save(&state(id)).await.unwrap();
        }
        std::fs::remove_file(store.document_path("gone")).unwrap();
        set_age(&store.backup_path("gone", 1), Duration::from_millis(150));
        set_age(&store.backup_path("kept", 1), Duration::from_millis(150));
        let stray = tmp.path().join(".gone.json.0190.tmp");
        std::fs::write(&stray, "{").unwrap();
        set_age(&stray, Duration::from_millis(150));

        let removed = store.cleanup(Duration::from_millis(100)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(!store.backup_path("gone", 1).exists());
        assert!(!stray.exists());
        assert!(store.backup_path("kept", 1).exists());
        assert!(store.load("kept").await.unwrap().is_some());
    }

    #[test]
    fn test_backup_owner() {
        assert_eq!(backup_owner("run-1.json.bak.3"), Some("run-1"));
        assert_eq!(backup_owner("run-1.json"), None);
        assert_eq!(backup_owner("run-1.json.bak.x"), None);
        assert_eq!(backup_owner("notes.bak.1"), None);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let store = FsStateStore::new(tmp.path(), 1);
        store.save(&state("clean")).await.unwrap();

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["clean.json"]);
    }
}
