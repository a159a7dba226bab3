use thiserror::Error;

use crate::state_machine::{JobState, Violation};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Unknown state: {0}")]
    UnknownState(String),

    #[error("Invalid transition from {from} to {to}: {}", join(.violations))]
    InvalidTransition {
        from: JobState,
        to: JobState,
        violations: Vec<Violation>,
    },

    #[error("Job {job_id} is in terminal state {state}")]
    TerminalState { job_id: String, state: JobState },

    #[error("Job {job_id} was modified concurrently (expected version {expected_version})")]
    ConcurrentModification {
        job_id: String,
        expected_version: u64,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[source] StoreError),

    #[error("Field {field} cannot be edited while job is {state}")]
    FieldNotEditable { field: &'static str, state: JobState },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Automation effect failed: {0}")]
    AutomationEffect(String),
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                job_id,
                expected_version,
                ..
            } => WorkflowError::ConcurrentModification {
                job_id,
                expected_version,
            },
            StoreError::NotFound(job_id) => WorkflowError::JobNotFound(job_id),
            other => WorkflowError::Persistence(other),
        }
    }
}

impl WorkflowError {
    /// Classifies the error for retry decisions.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WorkflowError::ConcurrentModification { .. }
            | WorkflowError::Persistence(_)
            | WorkflowError::AutomationEffect(_) => FailureKind::System,
            _ => FailureKind::Business,
        }
    }

    /// Whether re-reading the job and retrying the transition may succeed.
    /// Failed effects are system failures too, but they are redispatched
    /// rather than retried with the transition.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::System
            && !matches!(self, WorkflowError::AutomationEffect(_))
    }

    /// Violations carried by an [`WorkflowError::InvalidTransition`].
    pub fn violations(&self) -> &[Violation] {
        match self {
            WorkflowError::InvalidTransition { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Classifies a failure for retry logic decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Business-rule failure; the caller must correct the input.
    Business,
    /// Infrastructure failure or lost race; retryable.
    System,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}
