//! repairflow: a job-sheet workflow engine for repair-service businesses.
//!
//! A job sheet moves through twelve business states from intake to delivery.
//! [`engine::LifecycleEngine`] is the entry point; it validates every
//! transition against the [`state_machine::StateCatalog`], commits it with an
//! audit record through a [`store::JobStore`], and runs the entered state's
//! automation through [`capabilities::Capabilities`].

pub mod analytics;
pub mod automation;
pub mod capabilities;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod ui;

pub use engine::{LifecycleEngine, RetryConfig, TransitionOutcome, TransitionRequest};
pub use error::{FailureKind, WorkflowError};
