use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// The twelve canonical states of a job sheet.
///
/// Every job flows: CREATED → IN_DIAGNOSIS → AWAITING_APPROVAL → APPROVED →
/// IN_PROGRESS → TESTING → QUALITY_CHECK → COMPLETED → DELIVERED, with detours
/// through PARTS_ORDERED and CUSTOMER_APPROVED and an exit to CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    InDiagnosis,
    AwaitingApproval,
    Approved,
    InProgress,
    PartsOrdered,
    Testing,
    QualityCheck,
    Completed,
    CustomerApproved,
    Delivered,
    Cancelled,
}

impl JobState {
    /// All states in catalog order.
    pub const ALL: [JobState; 12] = [
        JobState::Created,
        JobState::InDiagnosis,
        JobState::AwaitingApproval,
        JobState::Approved,
        JobState::InProgress,
        JobState::PartsOrdered,
        JobState::Testing,
        JobState::QualityCheck,
        JobState::Completed,
        JobState::CustomerApproved,
        JobState::Delivered,
        JobState::Cancelled,
    ];

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Delivered | JobState::Cancelled)
    }

    /// Position of the state in [`JobState::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::InDiagnosis => "IN_DIAGNOSIS",
            JobState::AwaitingApproval => "AWAITING_APPROVAL",
            JobState::Approved => "APPROVED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::PartsOrdered => "PARTS_ORDERED",
            JobState::Testing => "TESTING",
            JobState::QualityCheck => "QUALITY_CHECK",
            JobState::Completed => "COMPLETED",
            JobState::CustomerApproved => "CUSTOMER_APPROVED",
            JobState::Delivered => "DELIVERED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = WorkflowError;

    /// Accepts the canonical upper-case ids; lower-case and dashed spellings are
    /// normalised first so CLI input like `in-progress` resolves.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_uppercase().replace('-', "_");
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalised)
            .ok_or_else(|| WorkflowError::UnknownState(s.to_string()))
    }
}

/// Urgency of a job. Urgent jobs escalate after half the usual timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Urgent => write!(f, "URGENT"),
        }
    }
}
