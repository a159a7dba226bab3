use std::fmt;

use serde::Serialize;

use super::catalog::{RequiredField, StateCatalog};
use super::job::JobSheet;
use super::state::JobState;

/// A single business-rule breach found while validating a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    IllegalTransition { from: JobState, to: JobState },
    MissingRequiredField { state: JobState, field: RequiredField },
    DiagnosisNotesRequired,
    EstimatedHoursRequired,
    CustomerApprovalRequired,
    TestResultsRequired,
    QualityCheckRequired,
    QualityScoreBelowThreshold { score: u8, threshold: u8 },
    CancellationReasonRequired,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::IllegalTransition { from, to } => {
                write!(f, "illegal transition from {from} to {to}")
            }
            Violation::MissingRequiredField { state, field } => {
                write!(f, "{field} is required before leaving {state}")
            }
            Violation::DiagnosisNotesRequired => write!(f, "diagnosis notes required"),
            Violation::EstimatedHoursRequired => write!(f, "estimated hours must be positive"),
            Violation::CustomerApprovalRequired => write!(f, "customer approval required"),
            Violation::TestResultsRequired => write!(f, "testing results required"),
            Violation::QualityCheckRequired => write!(f, "quality check result required"),
            Violation::QualityScoreBelowThreshold { score, threshold } => {
                write!(f, "quality score below threshold {threshold} (scored {score})")
            }
            Violation::CancellationReasonRequired => write!(f, "cancellation reason required"),
        }
    }
}

/// Outcome of [`TransitionValidator::validate`]: every violation, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    fn push(&mut self, violation: Violation) {
        if !self.violations.contains(&violation) {
            self.violations.push(violation);
        }
    }
}

/// Caller-supplied context that accompanies a transition request.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub reason: &'a str,
}

/// Pure checks deciding whether a job may move to a target state.
pub struct TransitionValidator<'a> {
    catalog: &'a StateCatalog,
}

impl<'a> TransitionValidator<'a> {
    pub fn new(catalog: &'a StateCatalog) -> Self {
        Self { catalog }
    }

    /// Runs, in order:
    ///
    /// - adjacency: the target must be an allowed next state;
    /// - exit requirements: required fields of the state being left (a
    ///   cancellation instead needs a reason);
    /// - entry rules of the target state.
    pub fn validate(
        &self,
        job: &JobSheet,
        target: JobState,
        context: TransitionContext<'_>,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let current = self.catalog.definition(job.state);

        if !current.allows(target) {
            report.push(Violation::IllegalTransition {
                from: job.state,
                to: target,
            });
        }

        if target == JobState::Cancelled {
            if context.reason.trim().is_empty() {
                report.push(Violation::CancellationReasonRequired);
            }
        } else {
            for field in &current.required_fields {
                if !field.is_present(job) {
                    report.push(Violation::MissingRequiredField {
                        state: job.state,
                        field: *field,
                    });
                }
            }
        }

        self.check_entry_rules(job, target, &mut report);
        report
    }

    fn check_entry_rules(&self, job: &JobSheet, target: JobState, report: &mut ValidationReport) {
        let docs = &job.documentation;
        match target {
            JobState::AwaitingApproval => {
                if !docs.has_diagnosis_notes() {
                    report.push(Violation::DiagnosisNotesRequired);
                }
                if !docs.has_positive_estimate() {
                    report.push(Violation::EstimatedHoursRequired);
                }
            }
            JobState::InProgress => {
                if job.milestones.customer_approved_at.is_none() {
                    report.push(Violation::CustomerApprovalRequired);
                }
            }
            JobState::QualityCheck => {
                if !docs.has_test_results() {
                    report.push(Violation::TestResultsRequired);
                }
            }
            JobState::Completed => match &docs.quality_check {
                None => report.push(Violation::QualityCheckRequired),
                Some(check) if check.score < self.catalog.quality_threshold => {
                    report.push(Violation::QualityScoreBelowThreshold {
                        score: check.score,
                        threshold: self.catalog.quality_threshold,
                    });
                }
                Some(_) => {}
            },
            _ => {}
        }
    }
}
