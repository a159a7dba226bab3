use thiserror::Error;

/// Errors raised by a [`JobStore`](super::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the stored version is not the one the
    /// caller read.
    #[error("version conflict on job {job_id}: expected {expected_version}, found {actual_version}")]
    Conflict {
        job_id: String,
        expected_version: u64,
        actual_version: u64,
    },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("duplicate job number: {0}")]
    DuplicateJobNumber(String),

    /// An audit record would break the job's gap-free sequence.
    #[error("audit sequence mismatch for job {job_id}: expected {expected}, got {found}")]
    SequenceMismatch {
        job_id: String,
        expected: u64,
        found: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}
