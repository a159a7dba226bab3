use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::info;

use repairflow::capabilities::{Capabilities, TracingCapabilities};
use repairflow::cli::{Cli, Command, DocumentAction, DocumentArgs};
use repairflow::config::RepairflowConfig;
use repairflow::engine::{DocumentationUpdate, LifecycleEngine, TransitionRequest};
use repairflow::logging::init_logging;
use repairflow::state_machine::{JobState, NewJob, StateCatalog};
use repairflow::store::{FileJobStore, InMemoryJobStore, JobStore};
use repairflow::sweeper::EscalationSweeper;
use repairflow::ui::Printer;
use repairflow::WorkflowError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match RepairflowConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level, cli.verbose);

    let printer = Printer::new(cli.json);
    match run(cli.command, &config, &printer).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<WorkflowError>() {
                Some(err) => printer.error(err),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &RepairflowConfig, printer: &Printer) -> Result<()> {
    let catalog = Arc::new(StateCatalog::with_overrides(&config.catalog_overrides()?));
    let store = FileJobStore::open(&config.store_path)
        .await
        .with_context(|| format!("failed to open store {}", config.store_path.display()))?;
    info!(path = %store.path().display(), "using job store");
    let engine = LifecycleEngine::new(Arc::new(store), Arc::new(TracingCapabilities), catalog);

    match command {
        Command::Create {
            customer,
            device,
            technician,
            priority,
            problem,
            estimate,
        } => {
            let created = engine
                .create_job(NewJob {
                    customer_ref: customer,
                    device_ref: device,
                    technician_ref: technician,
                    priority: priority.into(),
                    problem_description: problem,
                    estimated_cost_cents: estimate,
                })
                .await?;
            printer.created(&created);
        }
        Command::Show { job } => {
            let id = resolve(&engine, &job).await?;
            printer.job_view(&engine.get_job(&id).await?);
        }
        Command::Transition {
            job,
            to,
            actor,
            reason,
            request_id,
            metadata,
        } => {
            let request = TransitionRequest {
                job_id: resolve(&engine, &job).await?,
                to,
                actor,
                reason,
                metadata: parse_metadata(&metadata)?,
                request_id,
            };
            let outcome = engine
                .transition_with_retry(request, &config.retry_config())
                .await?;
            printer.outcome(&outcome);
        }
        Command::Document(DocumentArgs { job, actor, action }) => {
            let id = resolve(&engine, &job).await?;
            let view = engine
                .update_documentation(&id, &actor, documentation_update(action))
                .await?;
            printer.job_view(&view);
        }
        Command::List { state } => printer.job_list(&engine.list_jobs(state).await?),
        Command::Catalog => printer.catalog(engine.catalog()),
        Command::Analytics => printer.analytics(&engine.analytics().await?),
        Command::Audit { job } => {
            let id = resolve(&engine, &job).await?;
            printer.audit(&engine.audit_export(&id).await?);
        }
        Command::Redispatch { job } => {
            let id = resolve(&engine, &job).await?;
            printer.effects(&engine.redispatch_effects(&id).await?);
        }
        Command::Sweep { watch } => {
            let mut sweeper =
                EscalationSweeper::for_engine(&engine).with_interval(config.sweep_interval());
            if watch {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        let _ = tx.send(()).await;
                    }
                });
                sweeper.with_shutdown(rx).run().await;
            } else {
                printer.sweep(&sweeper.sweep_once(chrono::Utc::now()).await?);
            }
        }
        Command::Demo => {
            let demo = LifecycleEngine::new(
                Arc::new(InMemoryJobStore::new()),
                Arc::new(TracingCapabilities),
                Arc::clone(engine.catalog()),
            );
            run_demo(&demo, printer).await?;
        }
    }
    Ok(())
}

/// Accept either a job id or a job number (JS-...).
async fn resolve<S: JobStore, C: Capabilities>(
    engine: &LifecycleEngine<S, C>,
    job: &str,
) -> Result<String, WorkflowError> {
    if job.starts_with("JS-") {
        Ok(engine.find_by_number(job).await?.job.id)
    } else {
        Ok(job.to_string())
    }
}

// `key=value` pairs; values that parse as JSON keep their type.
fn parse_metadata(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut metadata = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("metadata must be KEY=VALUE, got {pair:?}");
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
        metadata.insert(key.trim().to_string(), value);
    }
    Ok(metadata)
}

fn documentation_update(action: DocumentAction) -> DocumentationUpdate {
    match action {
        DocumentAction::Technician { technician } => DocumentationUpdate::AssignTechnician {
            technician_ref: technician,
        },
        DocumentAction::Photo { url } => DocumentationUpdate::AttachPhoto { url },
        DocumentAction::Diagnosis { notes, hours, cost } => DocumentationUpdate::RecordDiagnosis {
            notes,
            estimated_hours: hours,
            estimated_cost_cents: cost,
        },
        DocumentAction::Tests { results } => DocumentationUpdate::RecordTestResults { results },
        DocumentAction::Quality {
            score,
            inspector,
            issues,
        } => DocumentationUpdate::RecordQualityCheck {
            score,
            issues,
            inspector,
        },
        DocumentAction::FinalCost { cents } => DocumentationUpdate::SetFinalCost { cost_cents: cents },
    }
}

/// Walk one job from intake to delivery against an in-memory store.
async fn run_demo<S: JobStore, C: Capabilities>(
    engine: &LifecycleEngine<S, C>,
    printer: &Printer,
) -> Result<()> {
    let created = engine
        .create_job(NewJob {
            customer_ref: "customer-demo".into(),
            device_ref: "laptop-demo".into(),
            technician_ref: Some("tech-ana".into()),
            problem_description: "Laptop does not power on".into(),
            estimated_cost_cents: Some(18_000),
            ..Default::default()
        })
        .await?;
    printer.created(&created);
    let id = created.view.job.id.clone();

    let step = |to: JobState, reason: &str| {
        TransitionRequest::new(id.clone(), to, "tech-ana").reason(reason)
    };
    let edit = |update: DocumentationUpdate| engine.update_documentation(&id, "tech-ana", update);

    printer.outcome(&engine.transition(step(JobState::InDiagnosis, "bench free")).await?);
    edit(DocumentationUpdate::RecordDiagnosis {
        notes: "Shorted power management IC".into(),
        estimated_hours: 2.0,
        estimated_cost_cents: Some(16_500),
    })
    .await?;
    for (to, reason) in [
        (JobState::AwaitingApproval, "estimate sent"),
        (JobState::Approved, "customer approved by phone"),
        (JobState::InProgress, "repair started"),
        (JobState::Testing, "board replaced"),
    ] {
        printer.outcome(&engine.transition(step(to, reason)).await?);
    }
    edit(DocumentationUpdate::RecordTestResults {
        results: "Boots, charges, stress test passed".into(),
    })
    .await?;
    printer.outcome(&engine.transition(step(JobState::QualityCheck, "tests passed")).await?);

    edit(DocumentationUpdate::RecordQualityCheck {
        score: 80,
        issues: vec!["loose bottom screw".into()],
        inspector: "qa-rui".into(),
    })
    .await?;
    if let Err(err) = engine.transition(step(JobState::Completed, "qa done")).await {
        printer.error(&err);
    }
    edit(DocumentationUpdate::RecordQualityCheck {
        score: 97,
        issues: vec![],
        inspector: "qa-rui".into(),
    })
    .await?;
    edit(DocumentationUpdate::SetFinalCost { cost_cents: 16_500 }).await?;
    for (to, reason) in [
        (JobState::Completed, "qa passed"),
        (JobState::CustomerApproved, "customer confirmed"),
        (JobState::Delivered, "picked up"),
    ] {
        printer.outcome(&engine.transition(step(to, reason)).await?);
    }

    printer.audit(&engine.audit_export(&id).await?);
    printer.analytics(&engine.analytics().await?);
    Ok(())
}
