//! Static, versioned metadata for every job state.
//!
//! The catalog is built once at startup (the standard table plus configuration
//! overrides) and shared read-only behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::job::JobSheet;
use super::state::{JobState, Priority};
use crate::error::WorkflowError;

/// Version stamped into every transition record.
pub const CATALOG_VERSION: u32 = 1;

/// Default minimum quality score for entering COMPLETED.
pub const DEFAULT_QUALITY_THRESHOLD: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Sms,
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Sms => write!(f, "SMS"),
            Channel::Email => write!(f, "EMAIL"),
        }
    }
}

/// Who a state-entry notification is addressed to, resolved against the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRef {
    Customer,
    Technician,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Estimate,
    Invoice,
    WarrantyCertificate,
    DeliveryReceipt,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Estimate => write!(f, "estimate"),
            DocumentKind::Invoice => write!(f, "invoice"),
            DocumentKind::WarrantyCertificate => write!(f, "warranty_certificate"),
            DocumentKind::DeliveryReceipt => write!(f, "delivery_receipt"),
        }
    }
}

/// A side effect to run when a job enters a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutomationEffect {
    Notify {
        channel: Channel,
        template: String,
        recipient: RecipientRef,
    },
    ScheduleFollowUp {
        delay_minutes: u32,
        task: String,
    },
    ScoreQuality,
    GenerateDocument {
        document: DocumentKind,
    },
}

impl AutomationEffect {
    fn notify(channel: Channel, template: &str, recipient: RecipientRef) -> Self {
        AutomationEffect::Notify {
            channel,
            template: template.to_string(),
            recipient,
        }
    }

    fn follow_up(delay_minutes: u32, task: &str) -> Self {
        AutomationEffect::ScheduleFollowUp {
            delay_minutes,
            task: task.to_string(),
        }
    }
}

impl fmt::Display for AutomationEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationEffect::Notify {
                channel, template, ..
            } => write!(f, "notify:{channel}:{template}"),
            AutomationEffect::ScheduleFollowUp { task, .. } => write!(f, "schedule:{task}"),
            AutomationEffect::ScoreQuality => write!(f, "score_quality"),
            AutomationEffect::GenerateDocument { document } => write!(f, "generate:{document}"),
        }
    }
}

/// A job attribute that must be present before a state can be exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredField {
    Customer,
    Device,
    Technician,
    EstimatedCost,
    FinalCost,
}

impl RequiredField {
    pub fn is_present(&self, job: &JobSheet) -> bool {
        match self {
            RequiredField::Customer => !job.customer_ref.trim().is_empty(),
            RequiredField::Device => !job.device_ref.trim().is_empty(),
            RequiredField::Technician => job
                .technician_ref
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty()),
            RequiredField::EstimatedCost => job.financials.estimated_cost_cents.is_some(),
            RequiredField::FinalCost => job.financials.final_cost_cents.is_some(),
        }
    }
}

impl fmt::Display for RequiredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredField::Customer => write!(f, "customer"),
            RequiredField::Device => write!(f, "device"),
            RequiredField::Technician => write!(f, "technician"),
            RequiredField::EstimatedCost => write!(f, "estimated cost"),
            RequiredField::FinalCost => write!(f, "final cost"),
        }
    }
}

/// Documentation expected while a job sits in a state. Advisory: surfaced as a
/// checklist, enforced only where the validator has a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentationRequirement {
    IntakePhotos,
    DiagnosisNotes,
    LabourEstimate,
    TestResults,
    QualityChecklist,
    FinalCost,
}

impl DocumentationRequirement {
    pub fn is_satisfied(&self, job: &JobSheet) -> bool {
        let docs = &job.documentation;
        match self {
            DocumentationRequirement::IntakePhotos => !docs.photos.is_empty(),
            DocumentationRequirement::DiagnosisNotes => docs.has_diagnosis_notes(),
            DocumentationRequirement::LabourEstimate => docs.has_positive_estimate(),
            DocumentationRequirement::TestResults => docs.has_test_results(),
            DocumentationRequirement::QualityChecklist => docs.quality_check.is_some(),
            DocumentationRequirement::FinalCost => job.financials.final_cost_cents.is_some(),
        }
    }
}

impl fmt::Display for DocumentationRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentationRequirement::IntakePhotos => "intake photos",
            DocumentationRequirement::DiagnosisNotes => "diagnosis notes",
            DocumentationRequirement::LabourEstimate => "labour estimate",
            DocumentationRequirement::TestResults => "test results",
            DocumentationRequirement::QualityChecklist => "quality checklist",
            DocumentationRequirement::FinalCost => "final cost",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub timeout_minutes: u32,
    pub role: String,
}

impl EscalationPolicy {
    fn new(timeout_minutes: u32, role: &str) -> Self {
        Self {
            timeout_minutes,
            role: role.to_string(),
        }
    }

    /// Residency allowed before escalating; urgent jobs get half.
    pub fn timeout_for(&self, priority: Priority) -> TimeDelta {
        let minutes = match priority {
            Priority::Urgent => self.timeout_minutes / 2,
            _ => self.timeout_minutes,
        };
        TimeDelta::minutes(i64::from(minutes))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateDefinition {
    pub id: JobState,
    pub name: String,
    pub description: String,
    pub color: String,
    pub allowed_next: Vec<JobState>,
    pub required_fields: Vec<RequiredField>,
    pub documentation: Vec<DocumentationRequirement>,
    pub automation: Vec<AutomationEffect>,
    pub escalation: Option<EscalationPolicy>,
}

impl StateDefinition {
    pub fn allows(&self, target: JobState) -> bool {
        self.allowed_next.contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next.is_empty()
    }
}

/// Configuration-supplied adjustments applied on top of the standard table.
#[derive(Debug, Clone, Default)]
pub struct CatalogOverrides {
    pub quality_threshold: Option<u8>,
    pub escalation_minutes: BTreeMap<JobState, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateCatalog {
    pub version: u32,
    pub quality_threshold: u8,
    definitions: Vec<StateDefinition>,
}

impl Default for StateCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl StateCatalog {
    /// The standard repair-shop workflow.
    pub fn standard() -> Self {
        Self {
            version: CATALOG_VERSION,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            definitions: JobState::ALL.into_iter().map(standard_definition).collect(),
        }
    }

    pub fn with_overrides(overrides: &CatalogOverrides) -> Self {
        let mut catalog = Self::standard();
        if let Some(threshold) = overrides.quality_threshold {
            catalog.quality_threshold = threshold.min(100);
        }
        for (state, minutes) in &overrides.escalation_minutes {
            if let Some(policy) = catalog.definitions[state.index()].escalation.as_mut() {
                policy.timeout_minutes = *minutes;
            }
        }
        catalog
    }

    /// Look up a state by its string id, e.g. `"IN_DIAGNOSIS"`.
    pub fn get_state_definition(&self, state_id: &str) -> Result<&StateDefinition, WorkflowError> {
        let state: JobState = state_id.parse()?;
        Ok(self.definition(state))
    }

    pub fn definition(&self, state: JobState) -> &StateDefinition {
        &self.definitions[state.index()]
    }

    pub fn definitions(&self) -> impl Iterator<Item = &StateDefinition> {
        self.definitions.iter()
    }

    pub fn allowed_next(&self, state: JobState) -> &[JobState] {
        &self.definition(state).allowed_next
    }

    pub fn can_transition(&self, from: JobState, to: JobState) -> bool {
        self.definition(from).allows(to)
    }

    /// Checklist items of the job's current state that are not yet satisfied.
    pub fn outstanding_documentation(&self, job: &JobSheet) -> Vec<DocumentationRequirement> {
        self.definition(job.state)
            .documentation
            .iter()
            .copied()
            .filter(|req| !req.is_satisfied(job))
            .collect()
    }
}

fn standard_definition(state: JobState) -> StateDefinition {
    use AutomationEffect as E;
    use Channel::{Email, Sms};
    use DocumentationRequirement as D;
    use JobState::*;
    use RecipientRef::{Customer as ToCustomer, Technician as ToTechnician};

    let (name, description, color) = match state {
        Created => ("Job Created", "Device received and job sheet opened", "#6b7280"),
        InDiagnosis => ("In Diagnosis", "Technician is diagnosing the fault", "#3b82f6"),
        AwaitingApproval => ("Awaiting Approval", "Estimate sent, waiting for the customer", "#f59e0b"),
        Approved => ("Approved", "Customer approved the estimate", "#10b981"),
        InProgress => ("In Progress", "Repair work under way", "#6366f1"),
        PartsOrdered => ("Parts Ordered", "Waiting for parts to arrive", "#f97316"),
        Testing => ("Testing", "Repair is being tested", "#8b5cf6"),
        QualityCheck => ("Quality Check", "Final inspection before completion", "#ec4899"),
        Completed => ("Completed", "Repair finished, ready for pickup", "#22c55e"),
        CustomerApproved => ("Customer Approved", "Customer accepted the repair", "#14b8a6"),
        Delivered => ("Delivered", "Device returned to the customer", "#059669"),
        Cancelled => ("Cancelled", "Job cancelled", "#ef4444"),
    };

    let mut allowed_next = match state {
        Created => vec![InDiagnosis, Cancelled],
        InDiagnosis => vec![AwaitingApproval, Cancelled],
        AwaitingApproval => vec![Approved, InDiagnosis, Cancelled],
        Approved => vec![InProgress, PartsOrdered],
        InProgress => vec![Testing, PartsOrdered, Cancelled],
        PartsOrdered => vec![InProgress, Cancelled],
        Testing => vec![QualityCheck, InProgress],
        QualityCheck => vec![Completed, Testing],
        Completed => vec![CustomerApproved, Delivered],
        CustomerApproved => vec![Delivered],
        Delivered | Cancelled => vec![],
    };
    // Cancellation is open from every non-terminal state.
    if !state.is_terminal() && !allowed_next.contains(&Cancelled) {
        allowed_next.push(Cancelled);
    }

    let required_fields = match state {
        Created => vec![RequiredField::Customer, RequiredField::Device],
        InDiagnosis | InProgress => vec![RequiredField::Technician],
        AwaitingApproval => vec![RequiredField::EstimatedCost],
        Completed => vec![RequiredField::FinalCost],
        _ => vec![],
    };

    let documentation = match state {
        Created => vec![D::IntakePhotos],
        InDiagnosis => vec![D::DiagnosisNotes, D::LabourEstimate],
        Testing => vec![D::TestResults],
        QualityCheck => vec![D::QualityChecklist, D::FinalCost],
        Completed => vec![D::FinalCost],
        _ => vec![],
    };

    let automation = match state {
        Created => vec![E::notify(Sms, "job_received", ToCustomer)],
        InDiagnosis => vec![E::notify(Sms, "diagnosis_started", ToCustomer)],
        AwaitingApproval => vec![
            E::GenerateDocument {
                document: DocumentKind::Estimate,
            },
            E::notify(Email, "estimate_ready", ToCustomer),
            E::follow_up(24 * 60, "approval_reminder"),
        ],
        Approved => vec![E::notify(Sms, "repair_approved", ToTechnician)],
        InProgress => vec![E::notify(Sms, "repair_started", ToCustomer)],
        PartsOrdered => vec![
            E::notify(Email, "parts_ordered", ToCustomer),
            E::follow_up(48 * 60, "parts_eta_check"),
        ],
        Testing => vec![],
        QualityCheck => vec![E::ScoreQuality],
        Completed => vec![
            E::GenerateDocument {
                document: DocumentKind::Invoice,
            },
            E::notify(Sms, "repair_completed", ToCustomer),
        ],
        CustomerApproved => vec![E::GenerateDocument {
            document: DocumentKind::WarrantyCertificate,
        }],
        Delivered => vec![
            E::GenerateDocument {
                document: DocumentKind::DeliveryReceipt,
            },
            E::notify(Email, "delivery_receipt", ToCustomer),
            E::follow_up(7 * 24 * 60, "satisfaction_survey"),
        ],
        Cancelled => vec![E::notify(Sms, "job_cancelled", ToCustomer)],
    };

    let escalation = match state {
        Created => Some(EscalationPolicy::new(2 * 60, "front_desk")),
        InDiagnosis => Some(EscalationPolicy::new(24 * 60, "service_manager")),
        AwaitingApproval => Some(EscalationPolicy::new(48 * 60, "customer_service")),
        Approved => Some(EscalationPolicy::new(4 * 60, "workshop_lead")),
        InProgress => Some(EscalationPolicy::new(72 * 60, "workshop_lead")),
        PartsOrdered => Some(EscalationPolicy::new(7 * 24 * 60, "procurement")),
        Testing => Some(EscalationPolicy::new(24 * 60, "workshop_lead")),
        QualityCheck => Some(EscalationPolicy::new(8 * 60, "quality_lead")),
        Completed => Some(EscalationPolicy::new(72 * 60, "front_desk")),
        CustomerApproved => Some(EscalationPolicy::new(48 * 60, "front_desk")),
        Delivered | Cancelled => None,
    };

    StateDefinition {
        id: state,
        name: name.to_string(),
        description: description.to_string(),
        color: color.to_string(),
        allowed_next,
        required_fields,
        documentation,
        automation,
        escalation,
    }
}
