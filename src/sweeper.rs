//! Periodic escalation of jobs that sit in one state for too long.
//!
//! The sweeper only reads jobs and sends notices; it never transitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{Capabilities, CapabilityError, Notification, Recipient};
use crate::engine::LifecycleEngine;
use crate::error::WorkflowError;
use crate::state_machine::{Channel, JobSheet, JobState, StateCatalog};
use crate::store::JobStore;

/// Default sweep interval (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub const ESCALATION_TEMPLATE: &str = "escalation_notice";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub job_id: String,
    pub job_number: String,
    pub state: JobState,
    pub role: String,
    pub idle_minutes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Non-terminal jobs examined.
    pub scanned: usize,
    pub escalated: Vec<Escalation>,
    /// Notices that could not be delivered; retried on the next sweep.
    pub failed: usize,
}

pub struct EscalationSweeper<S, C> {
    store: Arc<S>,
    capabilities: Arc<C>,
    catalog: Arc<StateCatalog>,
    interval: Duration,
    // job id -> version that was escalated; one notice per idle residency
    escalated: HashMap<String, u64>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl<S: JobStore, C: Capabilities> EscalationSweeper<S, C> {
    pub fn new(store: Arc<S>, capabilities: Arc<C>, catalog: Arc<StateCatalog>) -> Self {
        Self {
            store,
            capabilities,
            catalog,
            interval: DEFAULT_SWEEP_INTERVAL,
            escalated: HashMap::new(),
            shutdown_rx: None,
        }
    }

    /// Sweeper sharing the engine's store, capabilities and catalog.
    pub fn for_engine(engine: &LifecycleEngine<S, C>) -> Self {
        Self::new(
            Arc::clone(engine.store()),
            Arc::clone(engine.capabilities()),
            Arc::clone(engine.catalog()),
        )
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_shutdown(mut self, rx: mpsc::Receiver<()>) -> Self {
        self.shutdown_rx = Some(rx);
        self
    }

    /// Run sweeps until the shutdown channel fires or closes.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        info!(interval_secs = self.interval.as_secs(), "escalation sweeper started");
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if !report.escalated.is_empty() || report.failed > 0 => info!(
                            scanned = report.scanned,
                            escalated = report.escalated.len(),
                            failed = report.failed,
                            "sweep finished"
                        ),
                        Ok(report) => debug!(scanned = report.scanned, "sweep finished"),
                        Err(e) => error!(error = %e, "sweep failed"),
                    }
                }
                _ = async {
                    if let Some(ref mut rx) = self.shutdown_rx {
                        rx.recv().await
                    } else {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("escalation sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Escalate every non-terminal job idle for longer than its state allows
    /// as of `now`.
    pub async fn sweep_once(&mut self, now: DateTime<Utc>) -> Result<SweepReport, WorkflowError> {
        let jobs = self.store.list_jobs(None).await?;
        let mut report = SweepReport::default();
        let mut live = HashSet::new();

        for job in jobs.iter().filter(|j| !j.is_terminal()) {
            report.scanned += 1;
            live.insert(job.id.as_str());

            let Some(policy) = &self.catalog.definition(job.state).escalation else {
                continue;
            };
            let idle = now - job.updated_at;
            if idle <= policy.timeout_for(job.priority) {
                continue;
            }
            if self.escalated.get(&job.id) == Some(&job.version) {
                continue;
            }

            match self.notify(job, &policy.role, idle.num_minutes()).await {
                Ok(()) => {
                    self.escalated.insert(job.id.clone(), job.version);
                    report.escalated.push(Escalation {
                        job_id: job.id.clone(),
                        job_number: job.job_number.clone(),
                        state: job.state,
                        role: policy.role.clone(),
                        idle_minutes: idle.num_minutes(),
                    });
                }
                Err(e) => {
                    warn!(job_id = %job.id, role = %policy.role, error = %e, "escalation notice failed");
                    report.failed += 1;
                }
            }
        }

        self.escalated.retain(|id, _| live.contains(id.as_str()));
        Ok(report)
    }

    async fn notify(
        &self,
        job: &JobSheet,
        role: &str,
        idle_minutes: i64,
    ) -> Result<(), CapabilityError> {
        let notification = Notification {
            channel: Channel::Email,
            template: ESCALATION_TEMPLATE.to_string(),
            recipient: Recipient::Role(role.to_string()),
            data: json!({
                "job_id": job.id,
                "job_number": job.job_number,
                "state": job.state,
                "priority": job.priority,
                "idle_minutes": idle_minutes,
            }),
        };
        self.capabilities.notify(&notification).await?;
        info!(job_id = %job.id, state = %job.state, role, idle_minutes, "job escalated");
        Ok(())
    }
}
