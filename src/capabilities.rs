//! The outbound capability interface used by automation and escalation.
//!
//! The engine never talks to SMS gateways, schedulers or document renderers
//! itself; it asks a [`Capabilities`] implementation to do so.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::state_machine::{Channel, DocumentKind};

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("delivery failed on {channel}: {message}")]
    Delivery { channel: Channel, message: String },

    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Resolved addressee of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum Recipient {
    Customer(String),
    Technician(String),
    Role(String),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Customer(r) => write!(f, "customer:{r}"),
            Recipient::Technician(r) => write!(f, "technician:{r}"),
            Recipient::Role(r) => write!(f, "role:{r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: Channel,
    pub template: String,
    pub recipient: Recipient,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Side-effecting collaborators. Implementations must be safe to call from
/// many request handlers at once.
#[allow(async_fn_in_trait)]
pub trait Capabilities {
    async fn notify(&self, notification: &Notification) -> Result<DeliveryHandle, CapabilityError>;

    async fn schedule_follow_up(
        &self,
        job_id: &str,
        delay: TimeDelta,
        task: &str,
    ) -> Result<(), CapabilityError>;

    async fn score_job(&self, job_id: &str) -> Result<QualityReport, CapabilityError>;

    /// Store a quality report with whatever tracks workshop quality over time.
    async fn record_quality_metric(
        &self,
        job_id: &str,
        report: &QualityReport,
    ) -> Result<(), CapabilityError>;

    async fn generate_document(
        &self,
        job_id: &str,
        kind: DocumentKind,
    ) -> Result<DocumentRef, CapabilityError>;
}

/// Capabilities that only log what they would do. Used by the CLI where no
/// gateway is configured.
#[derive(Debug, Clone, Default)]
pub struct TracingCapabilities;

impl Capabilities for TracingCapabilities {
    async fn notify(&self, notification: &Notification) -> Result<DeliveryHandle, CapabilityError> {
        let handle = DeliveryHandle(Uuid::new_v4().to_string());
        info!(
            channel = %notification.channel,
            template = %notification.template,
            recipient = %notification.recipient,
            handle = %handle.0,
            "notification queued"
        );
        Ok(handle)
    }

    async fn schedule_follow_up(
        &self,
        job_id: &str,
        delay: TimeDelta,
        task: &str,
    ) -> Result<(), CapabilityError> {
        info!(job_id, task, delay_minutes = delay.num_minutes(), "follow-up scheduled");
        Ok(())
    }

    async fn score_job(&self, job_id: &str) -> Result<QualityReport, CapabilityError> {
        Err(CapabilityError::Unavailable {
            service: "quality scorer".into(),
            message: format!("no scorer configured for job {job_id}"),
        })
    }

    async fn record_quality_metric(
        &self,
        job_id: &str,
        report: &QualityReport,
    ) -> Result<(), CapabilityError> {
        info!(
            job_id,
            score = report.score,
            issues = report.issues.len(),
            "quality metric recorded"
        );
        Ok(())
    }

    async fn generate_document(
        &self,
        job_id: &str,
        kind: DocumentKind,
    ) -> Result<DocumentRef, CapabilityError> {
        let doc = DocumentRef(format!("{kind}-{job_id}"));
        info!(job_id, document = %doc.0, "document generation requested");
        Ok(doc)
    }
}
