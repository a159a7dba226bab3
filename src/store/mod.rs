//! Persistence for job sheets and their audit trail.
//!
//! [`JobStore`] is the seam to whatever database backs the engine. Two
//! implementations ship with the crate: [`InMemoryJobStore`] for tests and
//! embedding, [`FileJobStore`] which keeps a JSON snapshot on disk for the CLI.

mod error;
mod file;
mod memory;

pub use error::StoreError;
pub use file::FileJobStore;
pub use memory::InMemoryJobStore;

use crate::state_machine::{JobSheet, JobState, TransitionRecord};

/// Storage contract used by the lifecycle engine.
///
/// `save_job` is the only mutation of an existing job. It is an optimistic
/// compare-and-swap on `version` and, when a record is given, appends it in the
/// same atomic step: either both land or neither does.
#[allow(async_fn_in_trait)]
pub trait JobStore {
    /// Store a freshly created job. Fails if the id or job number is taken.
    async fn insert_job(&self, job: &JobSheet) -> Result<(), StoreError>;

    async fn load_job(&self, job_id: &str) -> Result<Option<JobSheet>, StoreError>;

    async fn load_job_by_number(&self, job_number: &str) -> Result<Option<JobSheet>, StoreError>;

    /// All jobs, optionally restricted to one state, ordered by creation time.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobSheet>, StoreError>;

    /// Replace the job if its stored version equals `expected_version`.
    ///
    /// Returns `StoreError::Conflict` when another writer got there first.
    async fn save_job(
        &self,
        job: &JobSheet,
        expected_version: u64,
        record: Option<&TransitionRecord>,
    ) -> Result<(), StoreError>;

    /// The job's transition records in sequence order.
    async fn audit_trail(&self, job_id: &str) -> Result<Vec<TransitionRecord>, StoreError>;

    /// Mark the effects identified by `key` as dispatched. Returns `false` if
    /// they were already claimed.
    async fn claim_effects(&self, key: &str) -> Result<bool, StoreError>;
}
