use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobState, Priority};

/// Result of the quality inspection performed in QUALITY_CHECK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Score out of 100.
    pub score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    pub inspector: String,
    pub checked_at: DateTime<Utc>,
}

/// Documentation accumulated while the job moves through the workshop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Documentation {
    pub diagnosis_notes: Option<String>,
    pub estimated_hours: Option<f32>,
    #[serde(default)]
    pub photos: Vec<String>,
    pub test_results: Option<String>,
    pub quality_check: Option<QualityCheck>,
}

impl Documentation {
    pub fn has_diagnosis_notes(&self) -> bool {
        self.diagnosis_notes
            .as_deref()
            .is_some_and(|notes| !notes.trim().is_empty())
    }

    pub fn has_positive_estimate(&self) -> bool {
        self.estimated_hours.is_some_and(|hours| hours > 0.0)
    }

    pub fn has_test_results(&self) -> bool {
        self.test_results
            .as_deref()
            .is_some_and(|results| !results.trim().is_empty())
    }
}

/// Money amounts are integer cents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Financials {
    pub estimated_cost_cents: Option<i64>,
    pub final_cost_cents: Option<i64>,
    #[serde(default)]
    pub deposit_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub cancelled_at: DateTime<Utc>,
    pub cancelled_by: String,
    pub reason: String,
}

/// Milestone timestamps stamped by the engine on entering specific states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestones {
    pub started_at: Option<DateTime<Utc>>,
    pub diagnosed_at: Option<DateTime<Utc>>,
    pub customer_approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub customer_accepted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Intake data for a new job sheet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub customer_ref: String,
    pub device_ref: String,
    pub technician_ref: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub problem_description: String,
    pub estimated_cost_cents: Option<i64>,
}

/// A unit of repair work tracked through the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSheet {
    pub id: String,
    pub job_number: String,
    pub state: JobState,
    pub priority: Priority,
    /// Optimistic concurrency counter, bumped on every save.
    pub version: u64,
    pub customer_ref: String,
    pub device_ref: String,
    pub technician_ref: Option<String>,
    pub problem_description: String,
    #[serde(default)]
    pub documentation: Documentation,
    #[serde(default)]
    pub financials: Financials,
    #[serde(default)]
    pub milestones: Milestones,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSheet {
    pub fn new(intake: NewJob) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            job_number: job_number_for(&id, now),
            id: id.to_string(),
            state: JobState::Created,
            priority: intake.priority,
            version: 0,
            customer_ref: intake.customer_ref,
            device_ref: intake.device_ref,
            technician_ref: intake.technician_ref,
            problem_description: intake.problem_description,
            documentation: Documentation::default(),
            financials: Financials {
                estimated_cost_cents: intake.estimated_cost_cents,
                ..Default::default()
            },
            milestones: Milestones::default(),
            cancellation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock time from intake to completion, when completed.
    pub fn cycle_time(&self) -> Option<chrono::TimeDelta> {
        self.milestones
            .completed_at
            .map(|completed| completed - self.created_at)
    }
}

// JS-YYYYMMDD-XXXXXX, the suffix taken from the job's UUID.
fn job_number_for(id: &Uuid, now: DateTime<Utc>) -> String {
    let simple = id.simple().to_string().to_uppercase();
    format!("JS-{}-{}", now.format("%Y%m%d"), &simple[..6])
}
