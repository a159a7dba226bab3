use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use super::memory::StoreState;
use super::{JobStore, StoreError};
use crate::state_machine::{JobSheet, JobState, TransitionRecord};

/// Store backed by a JSON snapshot on disk, shared by every process that opens
/// the same path.
///
/// Reads load the current snapshot. Mutations take an exclusive lock on a
/// sibling `.lock` file, re-read the snapshot, apply the change and write it to
/// a temp file that is renamed over the snapshot. Version checks therefore run
/// against what is on disk, and a failed write changes nothing.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    lock_path: PathBuf,
    // Serializes writers of this instance so they queue here instead of
    // occupying blocking threads on the file lock.
    writer: Mutex<()>,
}

impl FileJobStore {
    /// Open the snapshot at `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            lock_path: path.with_extension("json.lock"),
            path,
            writer: Mutex::new(()),
        };
        store.read().await?;
        debug!(path = %store.path.display(), "opened job store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreState, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(StoreState::default()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _writer = self.writer.lock().await;
        let lock = self.lock().await?;
        let mut state = self.read().await?;
        let value = apply(&mut state)?;
        self.persist(&state).await?;
        drop(lock);
        Ok(value)
    }

    // The lock is held until the returned file is dropped.
    async fn lock(&self) -> Result<File, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock_path = self.lock_path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock()?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store lock task failed: {e}")))??;
        Ok(file)
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl JobStore for FileJobStore {
    async fn insert_job(&self, job: &JobSheet) -> Result<(), StoreError> {
        self.mutate(|state| state.insert(job)).await
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<JobSheet>, StoreError> {
        Ok(self.read().await?.get(job_id))
    }

    async fn load_job_by_number(&self, job_number: &str) -> Result<Option<JobSheet>, StoreError> {
        Ok(self.read().await?.get_by_number(job_number))
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobSheet>, StoreError> {
        Ok(self.read().await?.list(state))
    }

    async fn save_job(
        &self,
        job: &JobSheet,
        expected_version: u64,
        record: Option<&TransitionRecord>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| state.save(job, expected_version, record))
            .await
    }

    async fn audit_trail(&self, job_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self.read().await?.trail(job_id))
    }

    async fn claim_effects(&self, key: &str) -> Result<bool, StoreError> {
        self.mutate(|state| Ok(state.claim(key))).await
    }
}
