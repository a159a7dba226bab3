use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{JobStore, StoreError};
use crate::state_machine::{JobSheet, JobState, TransitionRecord};

/// Complete contents of a store. Mutations validate first and only then
/// write, so a failed call leaves the state untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    jobs: HashMap<String, JobSheet>,
    #[serde(default)]
    audit: HashMap<String, Vec<TransitionRecord>>,
    #[serde(default)]
    claimed_effects: HashSet<String>,
}

impl StoreState {
    pub(crate) fn insert(&mut self, job: &JobSheet) -> Result<(), StoreError> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        if self.jobs.values().any(|j| j.job_number == job.job_number) {
            return Err(StoreError::DuplicateJobNumber(job.job_number.clone()));
        }
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<JobSheet> {
        self.jobs.get(job_id).cloned()
    }

    pub(crate) fn get_by_number(&self, job_number: &str) -> Option<JobSheet> {
        self.jobs
            .values()
            .find(|j| j.job_number == job_number)
            .cloned()
    }

    pub(crate) fn list(&self, state: Option<JobState>) -> Vec<JobSheet> {
        let mut jobs: Vec<JobSheet> = self
            .jobs
            .values()
            .filter(|j| state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub(crate) fn save(
        &mut self,
        job: &JobSheet,
        expected_version: u64,
        record: Option<&TransitionRecord>,
    ) -> Result<(), StoreError> {
        let stored = self
            .jobs
            .get(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                job_id: job.id.clone(),
                expected_version,
                actual_version: stored.version,
            });
        }

        if let Some(record) = record {
            let expected = self.audit.get(&job.id).map_or(0, Vec::len) as u64 + 1;
            if record.job_id != job.id || record.sequence != expected {
                return Err(StoreError::SequenceMismatch {
                    job_id: job.id.clone(),
                    expected,
                    found: record.sequence,
                });
            }
            self.audit
                .entry(job.id.clone())
                .or_default()
                .push(record.clone());
        }

        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    pub(crate) fn trail(&self, job_id: &str) -> Vec<TransitionRecord> {
        self.audit.get(job_id).cloned().unwrap_or_default()
    }

    pub(crate) fn claim(&mut self, key: &str) -> bool {
        if !self.claimed_effects.insert(key.to_string()) {
            return false;
        }
        self.prune_claims(key);
        true
    }

    // A finished job only ever redispatches its final transition, so once that
    // key is claimed the job's older keys are dropped.
    fn prune_claims(&mut self, key: &str) {
        let Some((job_id, sequence)) = key.rsplit_once(':') else {
            return;
        };
        let finished = self.jobs.get(job_id).is_some_and(JobSheet::is_terminal);
        let last = self.audit.get(job_id).map_or(0, Vec::len);
        if finished && sequence.parse() == Ok(last) {
            let prefix = format!("{job_id}:");
            self.claimed_effects
                .retain(|claimed| claimed == key || !claimed.starts_with(&prefix));
        }
    }
}

/// Process-local store guarded by an async `RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<StoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &JobSheet) -> Result<(), StoreError> {
        self.state.write().await.insert(job)
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<JobSheet>, StoreError> {
        Ok(self.state.read().await.get(job_id))
    }

    async fn load_job_by_number(&self, job_number: &str) -> Result<Option<JobSheet>, StoreError> {
        Ok(self.state.read().await.get_by_number(job_number))
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobSheet>, StoreError> {
        Ok(self.state.read().await.list(state))
    }

    async fn save_job(
        &self,
        job: &JobSheet,
        expected_version: u64,
        record: Option<&TransitionRecord>,
    ) -> Result<(), StoreError> {
        self.state.write().await.save(job, expected_version, record)
    }

    async fn audit_trail(&self, job_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self.state.read().await.trail(job_id))
    }

    async fn claim_effects(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.state.write().await.claim(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::NewJob;
    use chrono::Utc;
    use serde_json::Map;

    fn job() -> JobSheet {
        JobSheet::new(NewJob {
            customer_ref: "cust".into(),
            device_ref: "dev".into(),
            ..Default::default()
        })
    }

    fn record_for(job: &JobSheet, sequence: u64, to: JobState) -> TransitionRecord {
        TransitionRecord {
            id: format!("rec-{sequence}"),
            job_id: job.id.clone(),
            sequence,
            from_state: job.state,
            to_state: to,
            reason: String::new(),
            actor: "tester".into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
            catalog_version: 1,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn insert_then_load() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert_job(&job).await.unwrap();

        assert_eq!(store.load_job(&job.id).await.unwrap(), Some(job.clone()));
        assert_eq!(
            store.load_job_by_number(&job.job_number).await.unwrap(),
            Some(job.clone())
        );
        assert!(store.load_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_and_numbers_are_rejected() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert_job(&job).await.unwrap();
        assert!(matches!(
            store.insert_job(&job).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let mut twin = self::job();
        twin.job_number = job.job_number.clone();
        assert!(matches!(
            store.insert_job(&twin).await,
            Err(StoreError::DuplicateJobNumber(_))
        ));
    }

    #[tokio::test]
    async fn save_checks_version_and_appends_atomically() {
        let store = InMemoryJobStore::new();
        let original = job();
        store.insert_job(&original).await.unwrap();

        let record = record_for(&original, 1, JobState::InDiagnosis);
        let mut updated = original.clone();
        updated.state = JobState::InDiagnosis;
        updated.version = 1;
        store.save_job(&updated, 0, Some(&record)).await.unwrap();

        // A writer still holding version 0 loses and leaves no record behind.
        let stale = record_for(&original, 2, JobState::Cancelled);
        let err = store.save_job(&original, 0, Some(&stale)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected_version: 0,
                actual_version: 1,
                ..
            }
        ));
        assert_eq!(store.audit_trail(&original.id).await.unwrap(), vec![record]);
        assert_eq!(
            store.load_job(&original.id).await.unwrap().unwrap().state,
            JobState::InDiagnosis
        );
    }

    #[tokio::test]
    async fn out_of_sequence_records_are_rejected() {
        let store = InMemoryJobStore::new();
        let original = job();
        store.insert_job(&original).await.unwrap();

        let skipped = record_for(&original, 2, JobState::InDiagnosis);
        let err = store.save_job(&original, 0, Some(&skipped)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceMismatch {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert!(store.audit_trail(&original.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let store = InMemoryJobStore::new();
        let first = job();
        let mut second = job();
        second.state = JobState::Testing;
        store.insert_job(&first).await.unwrap();
        store.insert_job(&second).await.unwrap();

        assert_eq!(store.list_jobs(None).await.unwrap().len(), 2);
        let testing = store.list_jobs(Some(JobState::Testing)).await.unwrap();
        assert_eq!(testing.len(), 1);
        assert_eq!(testing[0].id, second.id);
    }

    #[tokio::test]
    async fn claims_of_finished_jobs_are_pruned() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        let other = self::job();
        store.insert_job(&job).await.unwrap();
        store.insert_job(&other).await.unwrap();
        assert!(store.claim_effects(&format!("{}:0", job.id)).await.unwrap());
        assert!(store.claim_effects(&format!("{}:0", other.id)).await.unwrap());

        let record = record_for(&job, 1, JobState::Cancelled);
        job.state = JobState::Cancelled;
        job.version = 1;
        store.save_job(&job, 0, Some(&record)).await.unwrap();
        let last = record.effect_key();
        assert!(store.claim_effects(&last).await.unwrap());

        let claimed = store.state.read().await.claimed_effects.clone();
        assert!(claimed.contains(&last));
        assert!(!claimed.contains(&format!("{}:0", job.id)));
        assert!(claimed.contains(&format!("{}:0", other.id)));
        assert!(!store.claim_effects(&last).await.unwrap());
    }

    #[tokio::test]
    async fn effects_are_claimed_once() {
        let store = InMemoryJobStore::new();
        assert!(store.claim_effects("job:1").await.unwrap());
        assert!(!store.claim_effects("job:1").await.unwrap());
        assert!(store.claim_effects("job:2").await.unwrap());
    }
}
