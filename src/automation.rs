//! State-entry side effects.
//!
//! After the engine commits a transition it hands the job to the
//! [`AutomationExecutor`], which runs every effect configured for the entered
//! state. Effects are best-effort: failures are logged and reported, never
//! propagated.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::capabilities::{Capabilities, CapabilityError, Notification, Recipient};
use crate::error::WorkflowError;
use crate::state_machine::{AutomationEffect, JobSheet, JobState, RecipientRef, StateCatalog};
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EffectStatus {
    Applied { detail: Option<String> },
    /// Not run because this transition's effects were already dispatched.
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectResult {
    pub effect: AutomationEffect,
    #[serde(flatten)]
    pub status: EffectStatus,
}

impl EffectResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, EffectStatus::Failed { .. })
    }

    /// The failure as a non-fatal workflow error, if the effect failed.
    pub fn error(&self) -> Option<WorkflowError> {
        match &self.status {
            EffectStatus::Failed { error } => Some(WorkflowError::AutomationEffect(format!(
                "{}: {error}",
                self.effect
            ))),
            _ => None,
        }
    }
}

pub struct AutomationExecutor<'a, S, C> {
    catalog: &'a StateCatalog,
    store: &'a S,
    capabilities: &'a C,
}

impl<'a, S: JobStore, C: Capabilities> AutomationExecutor<'a, S, C> {
    pub fn new(catalog: &'a StateCatalog, store: &'a S, capabilities: &'a C) -> Self {
        Self {
            catalog,
            store,
            capabilities,
        }
    }

    /// Run the entry effects of `to` for a committed transition.
    ///
    /// `effect_key` identifies the transition. It is claimed in the store
    /// before anything is dispatched; a key that was already claimed yields
    /// `Skipped` results so retries never send twice.
    pub async fn apply(
        &self,
        job: &JobSheet,
        from: Option<JobState>,
        to: JobState,
        effect_key: &str,
    ) -> Vec<EffectResult> {
        let effects = &self.catalog.definition(to).automation;
        if effects.is_empty() {
            return Vec::new();
        }

        match self.store.claim_effects(effect_key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, effect_key, "effects already dispatched");
                return effects
                    .iter()
                    .map(|effect| EffectResult {
                        effect: effect.clone(),
                        status: EffectStatus::Skipped {
                            reason: format!("already dispatched for {effect_key}"),
                        },
                    })
                    .collect();
            }
            Err(e) => {
                warn!(job_id = %job.id, effect_key, error = %e, "could not claim effects");
                return effects
                    .iter()
                    .map(|effect| EffectResult {
                        effect: effect.clone(),
                        status: EffectStatus::Failed {
                            error: format!("could not claim effects: {e}"),
                        },
                    })
                    .collect();
            }
        }

        let mut results = Vec::with_capacity(effects.len());
        for effect in effects {
            let status = match self.dispatch(job, from, to, effect).await {
                Ok(detail) => EffectStatus::Applied { detail },
                Err(error) => {
                    warn!(
                        job_id = %job.id,
                        effect = %effect,
                        error = %error,
                        "automation effect failed"
                    );
                    EffectStatus::Failed {
                        error: error.to_string(),
                    }
                }
            };
            results.push(EffectResult {
                effect: effect.clone(),
                status,
            });
        }
        results
    }

    async fn dispatch(
        &self,
        job: &JobSheet,
        from: Option<JobState>,
        to: JobState,
        effect: &AutomationEffect,
    ) -> Result<Option<String>, CapabilityError> {
        match effect {
            AutomationEffect::Notify {
                channel,
                template,
                recipient,
            } => {
                let recipient = resolve_recipient(job, *recipient)?;
                let notification = Notification {
                    channel: *channel,
                    template: template.clone(),
                    recipient,
                    data: json!({
                        "job_id": job.id,
                        "job_number": job.job_number,
                        "from_state": from,
                        "to_state": to,
                        "device_ref": job.device_ref,
                        "priority": job.priority,
                    }),
                };
                let handle = self.capabilities.notify(&notification).await?;
                Ok(Some(handle.0))
            }
            AutomationEffect::ScheduleFollowUp {
                delay_minutes,
                task,
            } => {
                let delay = chrono::TimeDelta::minutes(i64::from(*delay_minutes));
                self.capabilities
                    .schedule_follow_up(&job.id, delay, task)
                    .await?;
                Ok(None)
            }
            AutomationEffect::ScoreQuality => {
                let report = self.capabilities.score_job(&job.id).await?;
                self.capabilities
                    .record_quality_metric(&job.id, &report)
                    .await?;
                let detail = if report.issues.is_empty() {
                    format!("score {}", report.score)
                } else {
                    format!("score {} ({})", report.score, report.issues.join(", "))
                };
                Ok(Some(detail))
            }
            AutomationEffect::GenerateDocument { document } => {
                let doc = self
                    .capabilities
                    .generate_document(&job.id, *document)
                    .await?;
                Ok(Some(doc.0))
            }
        }
    }
}

fn resolve_recipient(job: &JobSheet, target: RecipientRef) -> Result<Recipient, CapabilityError> {
    match target {
        RecipientRef::Customer => Ok(Recipient::Customer(job.customer_ref.clone())),
        RecipientRef::Technician => job
            .technician_ref
            .clone()
            .map(Recipient::Technician)
            .ok_or_else(|| CapabilityError::Rejected("no technician assigned".into())),
    }
}
