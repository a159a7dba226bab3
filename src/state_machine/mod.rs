mod audit;
mod catalog;
mod job;
mod state;
mod validator;

pub use audit::{AuditExport, ReplayError, TransitionRecord, effect_key, replay};
pub use catalog::{
    AutomationEffect, CATALOG_VERSION, CatalogOverrides, Channel, DEFAULT_QUALITY_THRESHOLD,
    DocumentKind, DocumentationRequirement, EscalationPolicy, RecipientRef, RequiredField,
    StateCatalog, StateDefinition,
};
pub use job::{
    Cancellation, Documentation, Financials, JobSheet, Milestones, NewJob, QualityCheck,
};
pub use state::{JobState, Priority};
pub use validator::{TransitionContext, TransitionValidator, ValidationReport, Violation};
