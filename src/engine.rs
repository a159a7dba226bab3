//! The lifecycle engine: the public entry point for every job operation.
//!
//! A transition loads the job, validates it against the catalog, commits the
//! new state together with its audit record in one versioned save, and only
//! then runs the entered state's automation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::analytics::WorkflowAnalytics;
use crate::automation::{AutomationExecutor, EffectResult};
use crate::capabilities::Capabilities;
use crate::error::WorkflowError;
use crate::state_machine::{
    AuditExport, Cancellation, DocumentationRequirement, JobSheet, JobState, NewJob, QualityCheck,
    StateCatalog, TransitionContext, TransitionRecord, TransitionValidator, effect_key, replay,
};
use crate::store::{JobStore, StoreError};

/// Fresh job numbers drawn before a collision is reported to the caller.
const JOB_NUMBER_ATTEMPTS: u32 = 5;

/// Configuration for retrying transitions that lost a race or hit a store error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub job_id: String,
    pub to: JobState,
    pub actor: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Idempotency key. A request whose id is already recorded for the job is
    /// answered from the audit trail instead of being applied again.
    #[serde(default)]
    pub request_id: Option<String>,
}

impl TransitionRequest {
    pub fn new(job_id: impl Into<String>, to: JobState, actor: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            to,
            actor: actor.into(),
            reason: String::new(),
            metadata: Map::new(),
            request_id: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub job: JobSheet,
    pub record: TransitionRecord,
    pub effects: Vec<EffectResult>,
    /// One line per failed effect.
    pub warnings: Vec<String>,
    pub available_transitions: Vec<JobState>,
    pub outstanding_documentation: Vec<DocumentationRequirement>,
    /// True when the request was answered from an earlier identical request.
    pub replayed: bool,
}

/// A job together with what can be done with it next.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: JobSheet,
    pub available_transitions: Vec<JobState>,
    pub outstanding_documentation: Vec<DocumentationRequirement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedJob {
    #[serde(flatten)]
    pub view: JobView,
    pub effects: Vec<EffectResult>,
    pub warnings: Vec<String>,
}

/// Edits to a job's documentation, financials and assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentationUpdate {
    AssignTechnician {
        technician_ref: String,
    },
    AttachPhoto {
        url: String,
    },
    RecordDiagnosis {
        notes: String,
        estimated_hours: f32,
        estimated_cost_cents: Option<i64>,
    },
    RecordTestResults {
        results: String,
    },
    RecordQualityCheck {
        score: u8,
        #[serde(default)]
        issues: Vec<String>,
        inspector: String,
    },
    SetFinalCost {
        cost_cents: i64,
    },
}

impl DocumentationUpdate {
    /// Name of the edited field as reported in errors.
    pub fn field(&self) -> &'static str {
        match self {
            DocumentationUpdate::AssignTechnician { .. } => "technician",
            DocumentationUpdate::AttachPhoto { .. } => "photos",
            DocumentationUpdate::RecordDiagnosis { .. } => "diagnosis",
            DocumentationUpdate::RecordTestResults { .. } => "test_results",
            DocumentationUpdate::RecordQualityCheck { .. } => "quality_check",
            DocumentationUpdate::SetFinalCost { .. } => "final_cost",
        }
    }

    fn editable_in(&self, state: JobState) -> bool {
        match self {
            DocumentationUpdate::AssignTechnician { .. }
            | DocumentationUpdate::AttachPhoto { .. } => !state.is_terminal(),
            DocumentationUpdate::RecordDiagnosis { .. } => state == JobState::InDiagnosis,
            DocumentationUpdate::RecordTestResults { .. } => state == JobState::Testing,
            DocumentationUpdate::RecordQualityCheck { .. } => state == JobState::QualityCheck,
            DocumentationUpdate::SetFinalCost { .. } => {
                matches!(state, JobState::QualityCheck | JobState::Completed)
            }
        }
    }

    fn apply(self, job: &mut JobSheet, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        match self {
            DocumentationUpdate::AssignTechnician { technician_ref } => {
                let technician_ref = non_blank(technician_ref, "technician reference")?;
                job.technician_ref = Some(technician_ref);
            }
            DocumentationUpdate::AttachPhoto { url } => {
                let url = non_blank(url, "photo reference")?;
                job.documentation.photos.push(url);
            }
            DocumentationUpdate::RecordDiagnosis {
                notes,
                estimated_hours,
                estimated_cost_cents,
            } => {
                let notes = non_blank(notes, "diagnosis notes")?;
                if !(estimated_hours.is_finite() && estimated_hours > 0.0) {
                    return Err(WorkflowError::InvalidInput(format!(
                        "estimated hours must be positive, got {estimated_hours}"
                    )));
                }
                if let Some(cost) = estimated_cost_cents {
                    job.financials.estimated_cost_cents = Some(non_negative(cost)?);
                }
                job.documentation.diagnosis_notes = Some(notes);
                job.documentation.estimated_hours = Some(estimated_hours);
            }
            DocumentationUpdate::RecordTestResults { results } => {
                job.documentation.test_results = Some(non_blank(results, "test results")?);
            }
            DocumentationUpdate::RecordQualityCheck {
                score,
                issues,
                inspector,
            } => {
                if score > 100 {
                    return Err(WorkflowError::InvalidInput(format!(
                        "quality score must be between 0 and 100, got {score}"
                    )));
                }
                job.documentation.quality_check = Some(QualityCheck {
                    score,
                    issues,
                    inspector: non_blank(inspector, "inspector")?,
                    checked_at: now,
                });
            }
            DocumentationUpdate::SetFinalCost { cost_cents } => {
                job.financials.final_cost_cents = Some(non_negative(cost_cents)?);
            }
        }
        Ok(())
    }
}

fn non_blank(value: String, what: &str) -> Result<String, WorkflowError> {
    if value.trim().is_empty() {
        return Err(WorkflowError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(value)
}

fn non_negative(cents: i64) -> Result<i64, WorkflowError> {
    if cents < 0 {
        return Err(WorkflowError::InvalidInput(format!(
            "amount must not be negative, got {cents}"
        )));
    }
    Ok(cents)
}

/// Drives job sheets through the workflow.
pub struct LifecycleEngine<S, C> {
    store: Arc<S>,
    capabilities: Arc<C>,
    catalog: Arc<StateCatalog>,
}

impl<S, C> Clone for LifecycleEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            capabilities: Arc::clone(&self.capabilities),
            catalog: Arc::clone(&self.catalog),
        }
    }
}

impl<S: JobStore, C: Capabilities> LifecycleEngine<S, C> {
    pub fn new(store: Arc<S>, capabilities: Arc<C>, catalog: Arc<StateCatalog>) -> Self {
        Self {
            store,
            capabilities,
            catalog,
        }
    }

    pub fn catalog(&self) -> &Arc<StateCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn capabilities(&self) -> &Arc<C> {
        &self.capabilities
    }

    /// Open a new job sheet in CREATED and run the intake automation.
    #[instrument(skip_all, fields(customer = %intake.customer_ref))]
    pub async fn create_job(&self, intake: NewJob) -> Result<CreatedJob, WorkflowError> {
        if let Some(cost) = intake.estimated_cost_cents {
            non_negative(cost)?;
        }
        let mut attempt = 1;
        let job = loop {
            let job = JobSheet::new(intake.clone());
            match self.store.insert_job(&job).await {
                Ok(()) => break job,
                Err(StoreError::DuplicateJobNumber(number)) if attempt < JOB_NUMBER_ATTEMPTS => {
                    debug!(job_number = %number, attempt, "job number taken, drawing another");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(job_id = %job.id, job_number = %job.job_number, "job created");

        let effects = self
            .executor()
            .apply(&job, None, JobState::Created, &effect_key(&job.id, 0))
            .await;
        Ok(CreatedJob {
            warnings: warnings(&effects),
            view: self.view(job),
            effects,
        })
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobView, WorkflowError> {
        Ok(self.view(self.load(job_id).await?))
    }

    pub async fn find_by_number(&self, job_number: &str) -> Result<JobView, WorkflowError> {
        let job = self
            .store
            .load_job_by_number(job_number)
            .await?
            .ok_or_else(|| WorkflowError::JobNotFound(job_number.to_string()))?;
        Ok(self.view(job))
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobSheet>, WorkflowError> {
        Ok(self.store.list_jobs(state).await?)
    }

    pub async fn analytics(&self) -> Result<WorkflowAnalytics, WorkflowError> {
        let jobs = self.store.list_jobs(None).await?;
        Ok(WorkflowAnalytics::compute(&jobs))
    }

    /// The job's transition history, ordered by timestamp.
    pub async fn audit_export(&self, job_id: &str) -> Result<AuditExport, WorkflowError> {
        let job = self.load(job_id).await?;
        let trail = self.store.audit_trail(job_id).await?;
        match replay(job_id, &trail) {
            Ok(state) if state == job.state => {}
            Ok(state) => warn!(
                job_id,
                replayed = %state,
                current = %job.state,
                "audit trail does not end in the current state"
            ),
            Err(e) => warn!(job_id, error = %e, "audit trail is not contiguous"),
        }
        Ok(AuditExport::new(&job, trail))
    }

    /// Move a job to `request.to`.
    ///
    /// Nothing is written unless every validation rule passes. The state
    /// change and its audit record are saved together against the version
    /// that was loaded, so a concurrent writer makes this call fail with
    /// [`WorkflowError::ConcurrentModification`] instead of overwriting.
    #[instrument(
        skip(self, request),
        fields(job_id = %request.job_id, to = %request.to, actor = %request.actor)
    )]
    pub async fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let job = self.load(&request.job_id).await?;
        let trail = self.store.audit_trail(&job.id).await?;

        if let Some(request_id) = request.request_id.as_deref()
            && let Some(record) = trail
                .iter()
                .find(|r| r.request_id.as_deref() == Some(request_id))
        {
            if record.to_state != request.to {
                return Err(WorkflowError::InvalidInput(format!(
                    "request {request_id} was already used for a transition to {}",
                    record.to_state
                )));
            }
            debug!(request_id, sequence = record.sequence, "replaying recorded transition");
            let record = record.clone();
            return Ok(self.outcome(job, record, Vec::new(), true));
        }

        if job.is_terminal() {
            return Err(WorkflowError::TerminalState {
                job_id: job.id,
                state: job.state,
            });
        }

        let context = TransitionContext {
            reason: &request.reason,
        };
        let report = TransitionValidator::new(&self.catalog).validate(&job, request.to, context);
        if !report.is_ok() {
            debug!(violations = report.violations.len(), "transition rejected");
            return Err(WorkflowError::InvalidTransition {
                from: job.state,
                to: request.to,
                violations: report.violations,
            });
        }

        let now = Utc::now();
        let from = job.state;
        let expected_version = job.version;
        let mut next = job;
        enter_state(&mut next, &request, now);

        let record = TransitionRecord {
            id: Uuid::new_v4().to_string(),
            job_id: next.id.clone(),
            sequence: trail.len() as u64 + 1,
            from_state: from,
            to_state: request.to,
            reason: request.reason,
            actor: request.actor,
            timestamp: now,
            metadata: request.metadata,
            catalog_version: self.catalog.version,
            request_id: request.request_id,
        };

        if let Err(e) = self
            .store
            .save_job(&next, expected_version, Some(&record))
            .await
        {
            warn!(error = %e, expected_version, "transition not committed");
            return Err(e.into());
        }
        info!(
            from = %from,
            to = %record.to_state,
            sequence = record.sequence,
            "transition committed"
        );

        let effects = self
            .executor()
            .apply(&next, Some(from), record.to_state, &record.effect_key())
            .await;
        Ok(self.outcome(next, record, effects, false))
    }

    /// [`transition`](Self::transition), retried with exponential backoff while
    /// the failure is retryable. Each attempt re-reads and re-validates the job.
    pub async fn transition_with_retry(
        &self,
        request: TransitionRequest,
        retry: &RetryConfig,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let mut attempt = 0;
        loop {
            match self.transition(request.clone()).await {
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay_ms = retry.delay_for_attempt(attempt);
                    warn!(
                        job_id = %request.job_id,
                        kind = %e.failure_kind(),
                        attempt,
                        max_retries = retry.max_retries,
                        delay_ms,
                        error = %e,
                        "retrying transition"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                result => return result,
            }
        }
    }

    /// Run the effects of the job's latest transition again. Effects that were
    /// already dispatched come back as skipped.
    pub async fn redispatch_effects(&self, job_id: &str) -> Result<Vec<EffectResult>, WorkflowError> {
        let job = self.load(job_id).await?;
        let trail = self.store.audit_trail(job_id).await?;
        let effects = match trail.last() {
            Some(record) => {
                self.executor()
                    .apply(&job, Some(record.from_state), record.to_state, &record.effect_key())
                    .await
            }
            None => {
                self.executor()
                    .apply(&job, None, JobState::Created, &effect_key(&job.id, 0))
                    .await
            }
        };
        Ok(effects)
    }

    /// Edit a job's documentation. Each kind of edit is only accepted in the
    /// states where it is meaningful; the save is versioned like a transition
    /// but writes no audit record.
    #[instrument(skip(self, update), fields(field = update.field()))]
    pub async fn update_documentation(
        &self,
        job_id: &str,
        actor: &str,
        update: DocumentationUpdate,
    ) -> Result<JobView, WorkflowError> {
        let mut job = self.load(job_id).await?;
        if job.is_terminal() {
            return Err(WorkflowError::TerminalState {
                job_id: job.id,
                state: job.state,
            });
        }
        if !update.editable_in(job.state) {
            return Err(WorkflowError::FieldNotEditable {
                field: update.field(),
                state: job.state,
            });
        }

        let now = Utc::now();
        let expected_version = job.version;
        update.apply(&mut job, now)?;
        job.version += 1;
        job.updated_at = now;
        self.store.save_job(&job, expected_version, None).await?;
        info!(version = job.version, "documentation updated");
        Ok(self.view(job))
    }

    async fn load(&self, job_id: &str) -> Result<JobSheet, WorkflowError> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| WorkflowError::JobNotFound(job_id.to_string()))
    }

    fn executor(&self) -> AutomationExecutor<'_, S, C> {
        AutomationExecutor::new(&*self.catalog, &*self.store, &*self.capabilities)
    }

    fn view(&self, job: JobSheet) -> JobView {
        JobView {
            available_transitions: self.available_transitions(&job),
            outstanding_documentation: self.catalog.outstanding_documentation(&job),
            job,
        }
    }

    fn available_transitions(&self, job: &JobSheet) -> Vec<JobState> {
        self.catalog.allowed_next(job.state).to_vec()
    }

    fn outcome(
        &self,
        job: JobSheet,
        record: TransitionRecord,
        effects: Vec<EffectResult>,
        replayed: bool,
    ) -> TransitionOutcome {
        TransitionOutcome {
            warnings: warnings(&effects),
            available_transitions: self.available_transitions(&job),
            outstanding_documentation: self.catalog.outstanding_documentation(&job),
            job,
            record,
            effects,
            replayed,
        }
    }
}

fn warnings(effects: &[EffectResult]) -> Vec<String> {
    effects
        .iter()
        .filter_map(EffectResult::error)
        .map(|e| e.to_string())
        .collect()
}

// Stamp the entered state's milestone and bump the version. Entering TESTING
// or QUALITY_CHECK discards the previous round's results so a reworked job is
// tested and inspected again.
fn enter_state(job: &mut JobSheet, request: &TransitionRequest, now: DateTime<Utc>) {
    let milestones = &mut job.milestones;
    match request.to {
        JobState::Testing => job.documentation.test_results = None,
        JobState::QualityCheck => job.documentation.quality_check = None,
        JobState::AwaitingApproval => milestones.diagnosed_at = Some(now),
        JobState::Approved => milestones.customer_approved_at = Some(now),
        JobState::InProgress => {
            milestones.started_at.get_or_insert(now);
        }
        JobState::Completed => milestones.completed_at = Some(now),
        JobState::CustomerApproved => milestones.customer_accepted_at = Some(now),
        JobState::Delivered => milestones.delivered_at = Some(now),
        JobState::Cancelled => {
            job.cancellation = Some(Cancellation {
                cancelled_at: now,
                cancelled_by: request.actor.clone(),
                reason: request.reason.clone(),
            });
        }
        _ => {}
    }
    job.state = request.to;
    job.version += 1;
    job.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::EffectStatus;
    use crate::capabilities::testing::RecordingCapabilities;
    use crate::state_machine::Violation;
    use crate::store::InMemoryJobStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Barrier;

    type TestEngine<S = InMemoryJobStore> = LifecycleEngine<S, RecordingCapabilities>;

    fn engine() -> TestEngine {
        engine_with(InMemoryJobStore::new(), RecordingCapabilities::new())
    }

    fn engine_with<S: JobStore>(store: S, caps: RecordingCapabilities) -> TestEngine<S> {
        LifecycleEngine::new(
            Arc::new(store),
            Arc::new(caps),
            Arc::new(StateCatalog::standard()),
        )
    }

    fn intake() -> NewJob {
        NewJob {
            customer_ref: "cust-1".into(),
            device_ref: "laptop-1".into(),
            technician_ref: Some("tech-1".into()),
            problem_description: "No power".into(),
            estimated_cost_cents: Some(15_000),
            ..Default::default()
        }
    }

    async fn create<S: JobStore>(engine: &TestEngine<S>) -> String {
        engine.create_job(intake()).await.unwrap().view.job.id
    }

    async fn move_to<S: JobStore>(engine: &TestEngine<S>, job_id: &str, to: JobState) -> TransitionOutcome {
        engine
            .transition(TransitionRequest::new(job_id, to, "tech-1").reason("next step"))
            .await
            .unwrap()
    }

    async fn document<S: JobStore>(engine: &TestEngine<S>, job_id: &str, update: DocumentationUpdate) {
        engine
            .update_documentation(job_id, "tech-1", update)
            .await
            .unwrap();
    }

    fn diagnosis() -> DocumentationUpdate {
        DocumentationUpdate::RecordDiagnosis {
            notes: "Failed power IC".into(),
            estimated_hours: 2.5,
            estimated_cost_cents: None,
        }
    }

    /// Drive a fresh job to QUALITY_CHECK along the happy path.
    async fn job_in_quality_check<S: JobStore>(engine: &TestEngine<S>) -> String {
        let id = create(engine).await;
        move_to(engine, &id, JobState::InDiagnosis).await;
        document(engine, &id, diagnosis()).await;
        move_to(engine, &id, JobState::AwaitingApproval).await;
        move_to(engine, &id, JobState::Approved).await;
        move_to(engine, &id, JobState::InProgress).await;
        move_to(engine, &id, JobState::Testing).await;
        document(
            engine,
            &id,
            DocumentationUpdate::RecordTestResults {
                results: "Boots, charges, all ports OK".into(),
            },
        )
        .await;
        move_to(engine, &id, JobState::QualityCheck).await;
        id
    }

    fn quality(score: u8) -> DocumentationUpdate {
        DocumentationUpdate::RecordQualityCheck {
            score,
            issues: vec![],
            inspector: "qa-1".into(),
        }
    }

    #[tokio::test]
    async fn create_job_runs_intake_automation() {
        let engine = engine();
        let created = engine.create_job(intake()).await.unwrap();

        assert_eq!(created.view.job.state, JobState::Created);
        assert_eq!(
            created.view.available_transitions,
            vec![JobState::InDiagnosis, JobState::Cancelled]
        );
        assert!(created.warnings.is_empty());
        assert_eq!(engine.capabilities().templates(), vec!["job_received"]);

        let found = engine
            .find_by_number(&created.view.job.job_number)
            .await
            .unwrap();
        assert_eq!(found.job.id, created.view.job.id);
    }

    #[tokio::test]
    async fn create_job_rejects_negative_estimate() {
        let engine = engine();
        let err = engine
            .create_job(NewJob {
                estimated_cost_cents: Some(-1),
                ..intake()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
        assert!(engine.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let engine = engine();
        let err = engine
            .transition(TransitionRequest::new("nope", JobState::InDiagnosis, "tech-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::JobNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn illegal_transition_changes_nothing() {
        let engine = engine();
        let id = create(&engine).await;

        let err = engine
            .transition(TransitionRequest::new(&id, JobState::Delivered, "tech-1"))
            .await
            .unwrap_err();

        assert!(
            err.violations()
                .iter()
                .any(|v| v.to_string() == "illegal transition from CREATED to DELIVERED")
        );
        let view = engine.get_job(&id).await.unwrap();
        assert_eq!(view.job.state, JobState::Created);
        assert_eq!(view.job.version, 0);
        assert!(engine.store().audit_trail(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scenario_diagnosis_notes_gate_awaiting_approval() {
        let engine = engine();
        let id = create(&engine).await;

        let err = engine
            .transition(TransitionRequest::new(&id, JobState::AwaitingApproval, "tech-1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("diagnosis notes required"));

        move_to(&engine, &id, JobState::InDiagnosis).await;
        let err = engine
            .transition(TransitionRequest::new(&id, JobState::AwaitingApproval, "tech-1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.violations(),
            &[
                Violation::DiagnosisNotesRequired,
                Violation::EstimatedHoursRequired
            ]
        );

        document(&engine, &id, diagnosis()).await;
        let outcome = engine
            .transition(TransitionRequest::new(&id, JobState::AwaitingApproval, "tech-1"))
            .await
            .unwrap();
        assert_eq!(outcome.job.state, JobState::AwaitingApproval);
        assert!(outcome.job.milestones.diagnosed_at.is_some());
        assert_eq!(outcome.record.sequence, 2);
    }

    #[tokio::test]
    async fn scenario_quality_threshold_gates_completion() {
        let engine = engine();
        let id = job_in_quality_check(&engine).await;

        document(&engine, &id, quality(80)).await;
        let err = engine
            .transition(TransitionRequest::new(&id, JobState::Completed, "qa-1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quality score below threshold 95"));

        document(&engine, &id, quality(97)).await;
        document(&engine, &id, DocumentationUpdate::SetFinalCost { cost_cents: 14_500 }).await;
        let outcome = engine
            .transition(TransitionRequest::new(&id, JobState::Completed, "qa-1"))
            .await
            .unwrap();
        assert_eq!(outcome.job.state, JobState::Completed);
        assert!(outcome.job.milestones.completed_at.is_some());
        assert_eq!(
            outcome.available_transitions,
            vec![
                JobState::CustomerApproved,
                JobState::Delivered,
                JobState::Cancelled
            ]
        );
    }

    #[tokio::test]
    async fn rework_loop_requires_fresh_tests_and_inspection() {
        let engine = engine();
        let id = job_in_quality_check(&engine).await;
        document(&engine, &id, quality(97)).await;

        let back = move_to(&engine, &id, JobState::Testing).await;
        assert!(back.job.documentation.test_results.is_none());
        move_to(&engine, &id, JobState::InProgress).await;
        move_to(&engine, &id, JobState::Testing).await;

        let err = engine
            .transition(TransitionRequest::new(&id, JobState::QualityCheck, "tech-1"))
            .await
            .unwrap_err();
        assert_eq!(err.violations(), &[Violation::TestResultsRequired]);

        document(
            &engine,
            &id,
            DocumentationUpdate::RecordTestResults {
                results: "Retested after rework".into(),
            },
        )
        .await;
        let inspected = move_to(&engine, &id, JobState::QualityCheck).await;
        assert!(inspected.job.documentation.quality_check.is_none());

        document(&engine, &id, DocumentationUpdate::SetFinalCost { cost_cents: 14_500 }).await;
        let err = engine
            .transition(TransitionRequest::new(&id, JobState::Completed, "qa-1"))
            .await
            .unwrap_err();
        assert_eq!(err.violations(), &[Violation::QualityCheckRequired]);

        document(&engine, &id, quality(96)).await;
        let done = move_to(&engine, &id, JobState::Completed).await;
        assert_eq!(done.job.documentation.quality_check.map(|q| q.score), Some(96));
    }

    #[tokio::test]
    async fn in_progress_requires_customer_approval() {
        let engine = engine();
        let id = create(&engine).await;
        move_to(&engine, &id, JobState::InDiagnosis).await;
        document(&engine, &id, diagnosis()).await;
        move_to(&engine, &id, JobState::AwaitingApproval).await;
        let approved = move_to(&engine, &id, JobState::Approved).await;
        assert!(approved.job.milestones.customer_approved_at.is_some());

        let started = move_to(&engine, &id, JobState::InProgress).await;
        let first_start = started.job.milestones.started_at;
        assert!(first_start.is_some());

        move_to(&engine, &id, JobState::PartsOrdered).await;
        let resumed = move_to(&engine, &id, JobState::InProgress).await;
        assert_eq!(resumed.job.milestones.started_at, first_start);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_transitions() {
        let engine = engine();
        let id = create(&engine).await;
        engine
            .transition(
                TransitionRequest::new(&id, JobState::Cancelled, "front-desk")
                    .reason("customer withdrew"),
            )
            .await
            .unwrap();

        let err = engine
            .transition(TransitionRequest::new(&id, JobState::InDiagnosis, "tech-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::TerminalState {
                state: JobState::Cancelled,
                ..
            }
        ));
        assert_eq!(engine.store().audit_trail(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_reachable_from_every_non_terminal_state() {
        let catalog = StateCatalog::standard();
        for state in JobState::ALL {
            assert_eq!(
                catalog.can_transition(state, JobState::Cancelled),
                !state.is_terminal(),
                "{state}"
            );
        }

        let engine = engine();
        let id = job_in_quality_check(&engine).await;
        let outcome = engine
            .transition(
                TransitionRequest::new(&id, JobState::Cancelled, "manager")
                    .reason("beyond economic repair"),
            )
            .await
            .unwrap();
        let cancellation = outcome.job.cancellation.unwrap();
        assert_eq!(cancellation.cancelled_by, "manager");
        assert_eq!(cancellation.reason, "beyond economic repair");
        assert_eq!(engine.capabilities().templates().last().unwrap(), "job_cancelled");
    }

    #[tokio::test]
    async fn cancellation_needs_a_reason() {
        let engine = engine();
        let id = create(&engine).await;
        let err = engine
            .transition(TransitionRequest::new(&id, JobState::Cancelled, "front-desk"))
            .await
            .unwrap_err();
        assert_eq!(err.violations(), &[Violation::CancellationReasonRequired]);
    }

    #[tokio::test]
    async fn delivered_cannot_be_cancelled() {
        let engine = engine();
        let id = job_in_quality_check(&engine).await;
        document(&engine, &id, quality(99)).await;
        document(&engine, &id, DocumentationUpdate::SetFinalCost { cost_cents: 15_000 }).await;
        move_to(&engine, &id, JobState::Completed).await;
        let delivered = move_to(&engine, &id, JobState::Delivered).await;
        assert!(delivered.job.milestones.delivered_at.is_some());
        assert!(delivered.available_transitions.is_empty());

        let err = engine
            .transition(
                TransitionRequest::new(&id, JobState::Cancelled, "manager").reason("too late"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::TerminalState { .. }));
    }

    #[tokio::test]
    async fn repeated_request_id_is_replayed() {
        let engine = engine();
        let id = create(&engine).await;
        let request =
            TransitionRequest::new(&id, JobState::InDiagnosis, "tech-1").request_id("req-42");

        let first = engine.transition(request.clone()).await.unwrap();
        let second = engine.transition(request).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.record, first.record);
        assert!(second.effects.is_empty());
        assert_eq!(engine.store().audit_trail(&id).await.unwrap().len(), 1);
        assert_eq!(
            engine.capabilities().templates(),
            vec!["job_received", "diagnosis_started"]
        );
    }

    #[tokio::test]
    async fn request_id_reused_for_other_target_is_rejected() {
        let engine = engine();
        let id = create(&engine).await;
        engine
            .transition(TransitionRequest::new(&id, JobState::InDiagnosis, "t").request_id("r1"))
            .await
            .unwrap();

        let err = engine
            .transition(
                TransitionRequest::new(&id, JobState::Cancelled, "t")
                    .reason("x")
                    .request_id("r1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }

    /// Holds every loader at a barrier after reading, so two transitions
    /// observe the same version before either saves.
    struct RacingStore {
        inner: InMemoryJobStore,
        barrier: Barrier,
    }

    impl JobStore for RacingStore {
        async fn insert_job(&self, job: &JobSheet) -> Result<(), StoreError> {
            self.inner.insert_job(job).await
        }
        async fn load_job(&self, job_id: &str) -> Result<Option<JobSheet>, StoreError> {
            let job = self.inner.load_job(job_id).await;
            self.barrier.wait().await;
            job
        }
        async fn load_job_by_number(&self, n: &str) -> Result<Option<JobSheet>, StoreError> {
            self.inner.load_job_by_number(n).await
        }
        async fn list_jobs(&self, s: Option<JobState>) -> Result<Vec<JobSheet>, StoreError> {
            self.inner.list_jobs(s).await
        }
        async fn save_job(
            &self,
            job: &JobSheet,
            expected_version: u64,
            record: Option<&TransitionRecord>,
        ) -> Result<(), StoreError> {
            self.inner.save_job(job, expected_version, record).await
        }
        async fn audit_trail(&self, job_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
            self.inner.audit_trail(job_id).await
        }
        async fn claim_effects(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.claim_effects(key).await
        }
    }

    #[tokio::test]
    async fn concurrent_transitions_have_one_winner() {
        let engine = engine_with(
            RacingStore {
                inner: InMemoryJobStore::new(),
                barrier: Barrier::new(2),
            },
            RecordingCapabilities::new(),
        );
        let id = create(&engine).await;

        let (a, b) = tokio::join!(
            engine.transition(TransitionRequest::new(&id, JobState::InDiagnosis, "tech-1")),
            engine.transition(TransitionRequest::new(&id, JobState::InDiagnosis, "tech-2")),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(WorkflowError::ConcurrentModification {
                expected_version: 0,
                ..
            })
        )));
        let inner = &engine.store().inner;
        assert_eq!(inner.audit_trail(&id).await.unwrap().len(), 1);
        assert_eq!(
            engine.capabilities().templates(),
            vec!["job_received", "diagnosis_started"]
        );
    }

    /// Accepts inserts but fails every save.
    struct BrokenStore {
        inner: InMemoryJobStore,
    }

    impl JobStore for BrokenStore {
        async fn insert_job(&self, job: &JobSheet) -> Result<(), StoreError> {
            self.inner.insert_job(job).await
        }
        async fn load_job(&self, job_id: &str) -> Result<Option<JobSheet>, StoreError> {
            self.inner.load_job(job_id).await
        }
        async fn load_job_by_number(&self, n: &str) -> Result<Option<JobSheet>, StoreError> {
            self.inner.load_job_by_number(n).await
        }
        async fn list_jobs(&self, s: Option<JobState>) -> Result<Vec<JobSheet>, StoreError> {
            self.inner.list_jobs(s).await
        }
        async fn save_job(
            &self,
            _job: &JobSheet,
            _expected_version: u64,
            _record: Option<&TransitionRecord>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        async fn audit_trail(&self, job_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
            self.inner.audit_trail(job_id).await
        }
        async fn claim_effects(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.claim_effects(key).await
        }
    }

    /// Reports the first `collisions` inserts as job-number clashes.
    struct CollidingStore {
        inner: InMemoryJobStore,
        collisions: AtomicU32,
    }

    impl JobStore for CollidingStore {
        async fn insert_job(&self, job: &JobSheet) -> Result<(), StoreError> {
            let left = self.collisions.load(Ordering::SeqCst);
            if left > 0 {
                self.collisions.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::DuplicateJobNumber(job.job_number.clone()));
            }
            self.inner.insert_job(job).await
        }
        async fn load_job(&self, job_id: &str) -> Result<Option<JobSheet>, StoreError> {
            self.inner.load_job(job_id).await
        }
        async fn load_job_by_number(&self, n: &str) -> Result<Option<JobSheet>, StoreError> {
            self.inner.load_job_by_number(n).await
        }
        async fn list_jobs(&self, s: Option<JobState>) -> Result<Vec<JobSheet>, StoreError> {
            self.inner.list_jobs(s).await
        }
        async fn save_job(
            &self,
            job: &JobSheet,
            expected_version: u64,
            record: Option<&TransitionRecord>,
        ) -> Result<(), StoreError> {
            self.inner.save_job(job, expected_version, record).await
        }
        async fn audit_trail(&self, job_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
            self.inner.audit_trail(job_id).await
        }
        async fn claim_effects(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.claim_effects(key).await
        }
    }

    fn colliding(collisions: u32) -> TestEngine<CollidingStore> {
        engine_with(
            CollidingStore {
                inner: InMemoryJobStore::new(),
                collisions: AtomicU32::new(collisions),
            },
            RecordingCapabilities::new(),
        )
    }

    #[tokio::test]
    async fn job_number_collision_draws_a_new_number() {
        let engine = colliding(2);
        let created = engine.create_job(intake()).await.unwrap();

        assert_eq!(engine.list_jobs(None).await.unwrap().len(), 1);
        assert_eq!(
            engine
                .find_by_number(&created.view.job.job_number)
                .await
                .unwrap()
                .job
                .id,
            created.view.job.id
        );
    }

    #[tokio::test]
    async fn persistent_job_number_collisions_are_reported() {
        let engine = colliding(JOB_NUMBER_ATTEMPTS);
        let err = engine.create_job(intake()).await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Persistence(StoreError::DuplicateJobNumber(_))
        ));
        assert!(engine.list_jobs(None).await.unwrap().is_empty());
        assert!(engine.capabilities().calls().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_aborts_without_effects() {
        let engine = engine_with(
            BrokenStore {
                inner: InMemoryJobStore::new(),
            },
            RecordingCapabilities::new(),
        );
        let id = create(&engine).await;

        let err = engine
            .transition_with_retry(
                TransitionRequest::new(&id, JobState::InDiagnosis, "tech-1"),
                &RetryConfig {
                    max_retries: 2,
                    base_delay_ms: 1,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Persistence(StoreError::Io(_))));
        assert!(engine.store().inner.audit_trail(&id).await.unwrap().is_empty());
        assert_eq!(engine.capabilities().templates(), vec!["job_received"]);
    }

    #[tokio::test]
    async fn failed_effect_becomes_a_warning() {
        let caps = RecordingCapabilities::new();
        caps.fail_template("diagnosis_started");
        let engine = engine_with(InMemoryJobStore::new(), caps);
        let id = create(&engine).await;

        let outcome = move_to(&engine, &id, JobState::InDiagnosis).await;

        assert_eq!(outcome.job.state, JobState::InDiagnosis);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("Automation effect failed"));
        assert!(outcome.warnings[0].contains("diagnosis_started"));
        assert_eq!(engine.store().audit_trail(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redispatch_skips_claimed_effects() {
        let engine = engine();
        let id = create(&engine).await;
        move_to(&engine, &id, JobState::InDiagnosis).await;

        let effects = engine.redispatch_effects(&id).await.unwrap();
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0].status, EffectStatus::Skipped { .. }));
        assert_eq!(
            engine.capabilities().templates(),
            vec!["job_received", "diagnosis_started"]
        );
    }

    #[tokio::test]
    async fn audit_trail_replays_to_current_state() {
        let engine = engine();
        let id = job_in_quality_check(&engine).await;

        let export = engine.audit_export(&id).await.unwrap();
        assert_eq!(export.current_state, JobState::QualityCheck);
        assert_eq!(replay(&id, &export.transitions).unwrap(), export.current_state);
        assert_eq!(
            export.state_path(),
            vec![
                JobState::Created,
                JobState::InDiagnosis,
                JobState::AwaitingApproval,
                JobState::Approved,
                JobState::InProgress,
                JobState::Testing,
                JobState::QualityCheck,
            ]
        );
        assert!(export.transitions.iter().all(|r| r.catalog_version == 1));
    }

    #[tokio::test]
    async fn documentation_edits_are_state_gated() {
        let engine = engine();
        let id = create(&engine).await;

        let err = engine
            .update_documentation(&id, "tech-1", diagnosis())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::FieldNotEditable {
                field: "diagnosis",
                state: JobState::Created
            }
        ));

        let err = engine
            .update_documentation(&id, "tech-1", quality(90))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::FieldNotEditable { .. }));

        let view = engine
            .update_documentation(
                &id,
                "front-desk",
                DocumentationUpdate::AttachPhoto {
                    url: "photos/intake-1.jpg".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(view.job.documentation.photos, vec!["photos/intake-1.jpg"]);
        assert_eq!(view.job.version, 1);
        assert!(engine.store().audit_trail(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_documentation_input_is_rejected() {
        let engine = engine();
        let id = job_in_quality_check(&engine).await;

        let err = engine
            .update_documentation(&id, "qa-1", quality(101))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));

        let err = engine
            .update_documentation(
                &id,
                "qa-1",
                DocumentationUpdate::SetFinalCost { cost_cents: -5 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_technician_blocks_leaving_diagnosis() {
        let engine = engine();
        let id = engine
            .create_job(NewJob {
                technician_ref: None,
                ..intake()
            })
            .await
            .unwrap()
            .view
            .job
            .id;
        move_to(&engine, &id, JobState::InDiagnosis).await;
        document(&engine, &id, diagnosis()).await;

        let err = engine
            .transition(TransitionRequest::new(&id, JobState::AwaitingApproval, "t"))
            .await
            .unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert!(err.to_string().contains("is required before leaving IN_DIAGNOSIS"));

        document(
            &engine,
            &id,
            DocumentationUpdate::AssignTechnician {
                technician_ref: "tech-9".into(),
            },
        )
        .await;
        move_to(&engine, &id, JobState::AwaitingApproval).await;
    }

    #[tokio::test]
    async fn metadata_is_recorded() {
        let engine = engine();
        let id = create(&engine).await;
        let outcome = engine
            .transition(
                TransitionRequest::new(&id, JobState::InDiagnosis, "tech-1")
                    .metadata("bench", "B3"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.record.metadata["bench"], "B3");
        assert_eq!(outcome.job.version, 1);
    }

    #[test]
    fn retry_delay_doubles() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), 100);
        assert_eq!(retry.delay_for_attempt(2), 200);
        assert_eq!(retry.delay_for_attempt(3), 400);
    }
}
