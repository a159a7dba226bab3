use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::job::JobSheet;
use super::state::JobState;

/// Immutable audit entry written atomically with every committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub job_id: String,
    /// 1-based position in the job's history; gap-free.
    pub sequence: u64,
    pub from_state: JobState,
    pub to_state: JobState,
    pub reason: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub catalog_version: u32,
    /// Caller-supplied idempotency key.
    pub request_id: Option<String>,
}

impl TransitionRecord {
    /// Key under which the record's automation effects are claimed.
    pub fn effect_key(&self) -> String {
        effect_key(&self.job_id, self.sequence)
    }
}

pub fn effect_key(job_id: &str, sequence: u64) -> String {
    format!("{job_id}:{sequence}")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("record {sequence} belongs to job {found}, expected {expected}")]
    ForeignRecord {
        sequence: u64,
        expected: String,
        found: String,
    },

    #[error("expected sequence {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("record {sequence} starts from {from_state} but job was in {actual}")]
    Discontinuity {
        sequence: u64,
        from_state: JobState,
        actual: JobState,
    },
}

/// Replays an ordered transition history from CREATED and returns the state it
/// reaches. The history must be contiguous and belong to one job.
pub fn replay(job_id: &str, records: &[TransitionRecord]) -> Result<JobState, ReplayError> {
    let mut state = JobState::Created;
    for (i, record) in records.iter().enumerate() {
        let expected = i as u64 + 1;
        if record.job_id != job_id {
            return Err(ReplayError::ForeignRecord {
                sequence: record.sequence,
                expected: job_id.to_string(),
                found: record.job_id.clone(),
            });
        }
        if record.sequence != expected {
            return Err(ReplayError::SequenceGap {
                expected,
                found: record.sequence,
            });
        }
        if record.from_state != state {
            return Err(ReplayError::Discontinuity {
                sequence: record.sequence,
                from_state: record.from_state,
                actual: state,
            });
        }
        state = record.to_state;
    }
    Ok(state)
}

/// Compliance export of a job's full history, ordered by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExport {
    pub job_id: String,
    pub job_number: String,
    pub current_state: JobState,
    pub created_at: DateTime<Utc>,
    pub exported_at: DateTime<Utc>,
    pub transitions: Vec<TransitionRecord>,
}

impl AuditExport {
    pub fn new(job: &JobSheet, mut transitions: Vec<TransitionRecord>) -> Self {
        transitions.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });
        Self {
            job_id: job.id.clone(),
            job_number: job.job_number.clone(),
            current_state: job.state,
            created_at: job.created_at,
            exported_at: Utc::now(),
            transitions,
        }
    }

    /// The realized state path, CREATED first.
    pub fn state_path(&self) -> Vec<JobState> {
        std::iter::once(JobState::Created)
            .chain(self.transitions.iter().map(|t| t.to_state))
            .collect()
    }
}
