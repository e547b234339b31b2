//! Registry of runs and their status, serialising every mutation behind a
//! single lock and persisting `status.json` on each transition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use walkdir::WalkDir;

use crate::error::{CascadeError, ErrorCode, Result};
use crate::run_status::RunRecord;

const STATUS_FILE: &str = "status.json";

/// Exclusive, serialised view of `{run_id -> RunRecord}`.
///
/// On construction the store rehydrates by scanning `runs_dir` for persisted
/// `status.json` files, silently skipping any that fail to parse (a run
/// directory mid-write is not a reason to refuse to start).
pub struct RunStore {
    runs_dir: PathBuf,
    records: Mutex<HashMap<String, RunRecord>>,
}

impl RunStore {
    /// Opens (and rehydrates) a store rooted at `runs_dir`.
    pub fn open(runs_dir: impl Into<PathBuf>) -> Self {
        let runs_dir = runs_dir.into();
        let mut records = HashMap::new();
        for entry in WalkDir::new(&runs_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if entry.file_name() != STATUS_FILE {
                continue;
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            let Ok(record) = serde_json::from_slice::<RunRecord>(&bytes) else {
                continue;
            };
            records.insert(record.run_id.clone(), record);
        }
        Self {
            runs_dir,
            records: Mutex::new(records),
        }
    }

    fn status_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id).join(STATUS_FILE)
    }

    fn persist(&self, record: &RunRecord) -> Result<()> {
        let path = self.status_path(&record.run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CascadeError::io(parent.display().to_string(), e))?;
        }
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| CascadeError::json(format!("status for {}", record.run_id), e))?;
        std::fs::write(&path, bytes).map_err(|e| CascadeError::io(path.display().to_string(), e))
    }

    /// Registers a newly created run. Overwrites any prior record for the
    /// same id (used when a caller retries registration idempotently).
    pub fn register(&self, record: RunRecord) -> Result<()> {
        self.persist(&record)?;
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(record.run_id.clone(), record);
        Ok(())
    }

    /// Whether a run with this id is known to the store.
    #[must_use]
    pub fn exists(&self, run_id: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(run_id)
    }

    /// Fetches a copy of a run's current record.
    pub fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| CascadeError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Snapshots every known run record.
    #[must_use]
    pub fn all(&self) -> Vec<RunRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Applies `mutate` to the run's in-memory record and persists the
    /// result. Fails fatally (never silently creates) if `run_id` is
    /// unknown.
    pub fn update_status(
        &self,
        run_id: &str,
        mutate: impl FnOnce(&mut RunRecord),
    ) -> Result<RunRecord> {
        let mut guard = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let record = guard.get_mut(run_id).ok_or_else(|| CascadeError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        mutate(record);
        let snapshot = record.clone();
        drop(guard);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Marks a run as failed at `stage`, with the given message.
    pub fn mark_failed(&self, run_id: &str, message: impl Into<String>) -> Result<RunRecord> {
        let message = message.into();
        self.update_status(run_id, move |record| record.fail(message))
    }

    /// The directory a given run owns.
    #[must_use]
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStore")
            .field("runs_dir", &self.runs_dir)
            .field("run_count", &self.all().len())
            .finish()
    }
}

/// Returns the canonical run-artifact path for a given file name, mirroring
/// the stable directory layout every other component writes into.
#[must_use]
pub fn artifact_path(run_dir: &Path, file_name: &str) -> PathBuf {
    run_dir.join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_status::{RunState, Stage};

    #[test]
    fn register_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path());
        store.register(RunRecord::new("run_0000000001")).unwrap();
        let record = store.get("run_0000000001").unwrap();
        assert_eq!(record.state, RunState::Pending);
    }

    #[test]
    fn get_missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path());
        let err = store.get("run_missing").unwrap_err();
        assert!(matches!(err, CascadeError::RunNotFound { .. }));
    }

    #[test]
    fn update_status_on_missing_run_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path());
        let err = store
            .update_status("run_missing", |r| r.progress_pct = 10)
            .unwrap_err();
        assert!(matches!(err, CascadeError::RunNotFound { .. }));
    }

    #[test]
    fn rehydrates_from_disk_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RunStore::open(dir.path());
            let mut record = RunRecord::new("run_0000000002");
            record.advance(Stage::Ingest, 5, None);
            store.register(record).unwrap();
        }
        let reopened = RunStore::open(dir.path());
        assert!(reopened.exists("run_0000000002"));
        let record = reopened.get("run_0000000002").unwrap();
        assert_eq!(record.progress_pct, 5);
    }

    #[test]
    fn rehydrate_skips_malformed_status_files() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run_broken");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join(STATUS_FILE), b"not json").unwrap();
        let store = RunStore::open(dir.path());
        assert!(!store.exists("run_broken"));
    }

    #[test]
    fn mark_failed_freezes_progress_and_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path());
        let mut record = RunRecord::new("run_0000000003");
        record.advance(Stage::GeminiFlash, 60, None);
        store.register(record).unwrap();

        let failed = store.mark_failed("run_0000000003", "boom").unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert_eq!(failed.failed_stage, Some(Stage::GeminiFlash));
        assert_eq!(failed.progress_pct, 60);
    }
}
