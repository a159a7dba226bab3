//! Saída de terminal do repairflow com cores.
//!
//! Usa a crate `console` para estilização. O [`Printer`] formata jobs,
//! transições, catálogo, auditoria e relatórios; com `--json` imprime o
//! mesmo conteúdo serializado.

use console::Style;
use serde::Serialize;

use crate::analytics::WorkflowAnalytics;
use crate::automation::{EffectResult, EffectStatus};
use crate::engine::{CreatedJob, JobView, TransitionOutcome};
use crate::error::WorkflowError;
use crate::state_machine::{
    AuditExport, DocumentationRequirement, JobSheet, JobState, StateCatalog,
};
use crate::sweeper::SweepReport;

/// Formata resultados de comandos para o terminal.
pub struct Printer {
    // Quando verdadeiro, toda saída é JSON.
    json: bool,
    green: Style,
    red: Style,
    yellow: Style,
    cyan: Style,
    dim: Style,
}

impl Printer {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            cyan: Style::new().cyan().bold(),
            dim: Style::new().dim(),
        }
    }

    fn emit_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("  {} failed to serialize output: {e}", self.red.apply_to("✗")),
        }
    }

    fn state(&self, state: JobState) -> String {
        let style = match state {
            JobState::Delivered => &self.green,
            JobState::Cancelled => &self.red,
            _ => &self.cyan,
        };
        style.apply_to(state).to_string()
    }

    /// Exibe um job com as próximas transições e a documentação pendente.
    pub fn job_view(&self, view: &JobView) {
        if self.json {
            return self.emit_json(view);
        }
        self.job_header(&view.job);
        self.next_steps(&view.available_transitions, &view.outstanding_documentation);
    }

    pub fn created(&self, created: &CreatedJob) {
        if self.json {
            return self.emit_json(created);
        }
        println!("  {} Job created", self.green.apply_to("✓"));
        self.job_header(&created.view.job);
        self.effects(&created.effects);
        self.next_steps(
            &created.view.available_transitions,
            &created.view.outstanding_documentation,
        );
    }

    /// Exibe o resultado de uma transição: registro, efeitos e avisos.
    pub fn outcome(&self, outcome: &TransitionOutcome) {
        if self.json {
            return self.emit_json(outcome);
        }
        let mark = if outcome.replayed {
            self.yellow.apply_to("↻ replayed")
        } else {
            self.green.apply_to("✓")
        };
        println!(
            "  {mark} {} → {} (#{} by {})",
            self.state(outcome.record.from_state),
            self.state(outcome.record.to_state),
            outcome.record.sequence,
            outcome.record.actor
        );
        self.effects(&outcome.effects);
        for warning in &outcome.warnings {
            println!("  {} {warning}", self.yellow.apply_to("!"));
        }
        self.next_steps(
            &outcome.available_transitions,
            &outcome.outstanding_documentation,
        );
    }

    /// Exibe um erro do motor; violações aparecem uma por linha.
    pub fn error(&self, err: &WorkflowError) {
        eprintln!("  {} {err}", self.red.apply_to("✗"));
        for violation in err.violations() {
            eprintln!("    {} {violation}", self.red.apply_to("-"));
        }
    }

    pub fn job_list(&self, jobs: &[JobSheet]) {
        if self.json {
            return self.emit_json(&jobs);
        }
        if jobs.is_empty() {
            println!("  {}", self.dim.apply_to("no jobs"));
            return;
        }
        for job in jobs {
            println!(
                "  {}  {:<20} {:<8} {}",
                self.cyan.apply_to(&job.job_number),
                self.state(job.state),
                job.priority,
                self.dim.apply_to(&job.device_ref)
            );
        }
    }

    pub fn catalog(&self, catalog: &StateCatalog) {
        if self.json {
            return self.emit_json(catalog);
        }
        println!(
            "{}",
            self.cyan.apply_to(format!(
                "─── State catalog v{} (quality threshold {}) ───",
                catalog.version, catalog.quality_threshold
            ))
        );
        for def in catalog.definitions() {
            let next: Vec<String> = def.allowed_next.iter().map(ToString::to_string).collect();
            println!("  {} {}", self.state(def.id), self.dim.apply_to(&def.description));
            if !next.is_empty() {
                println!("      → {}", next.join(", "));
            }
            if let Some(policy) = &def.escalation {
                println!(
                    "      {} after {} min to {}",
                    self.yellow.apply_to("escalates"),
                    policy.timeout_minutes,
                    policy.role
                );
            }
        }
    }

    pub fn analytics(&self, analytics: &WorkflowAnalytics) {
        if self.json {
            return self.emit_json(analytics);
        }
        println!("{}", self.cyan.apply_to("─── Workflow analytics ───"));
        println!(
            "  total {}  active {}  urgent {}  delivered {}  cancelled {}",
            analytics.total_jobs,
            analytics.active_jobs,
            analytics.urgent_active,
            analytics.delivered,
            analytics.cancelled
        );
        for (state, count) in &analytics.counts_by_state {
            println!("  {:<20} {count}", self.state(*state));
        }
        if let Some(hours) = analytics.average_cycle_time_hours {
            println!("  average cycle time {hours:.1}h");
        }
        if let Some(rate) = analytics.delivery_rate {
            println!("  delivery rate {:.0}%", rate * 100.0);
        }
    }

    /// Imprime a trilha de auditoria em ordem cronológica.
    pub fn audit(&self, export: &AuditExport) {
        if self.json {
            return self.emit_json(export);
        }
        println!(
            "{}",
            self.cyan
                .apply_to(format!("─── Audit trail {} ───", export.job_number))
        );
        for record in &export.transitions {
            println!(
                "  #{:<3} {} {} → {} {} {}",
                record.sequence,
                self.dim.apply_to(record.timestamp.format("%Y-%m-%d %H:%M:%S")),
                self.state(record.from_state),
                self.state(record.to_state),
                record.actor,
                self.dim.apply_to(&record.reason)
            );
        }
    }

    pub fn sweep(&self, report: &SweepReport) {
        if self.json {
            return self.emit_json(report);
        }
        for escalation in &report.escalated {
            println!(
                "  {} {} idle {} min in {} → {}",
                self.yellow.apply_to("⚠"),
                escalation.job_number,
                escalation.idle_minutes,
                self.state(escalation.state),
                escalation.role
            );
        }
        println!(
            "  scanned {}, escalated {}, failed {}",
            report.scanned,
            report.escalated.len(),
            report.failed
        );
    }

    pub fn effects(&self, effects: &[EffectResult]) {
        if self.json {
            return self.emit_json(&effects);
        }
        for result in effects {
            let (mark, detail) = match &result.status {
                EffectStatus::Applied { detail } => {
                    (self.green.apply_to("•"), detail.clone().unwrap_or_default())
                }
                EffectStatus::Skipped { reason } => (self.dim.apply_to("○"), reason.clone()),
                EffectStatus::Failed { error } => (self.red.apply_to("✗"), error.clone()),
            };
            println!("    {mark} {} {}", result.effect, self.dim.apply_to(detail));
        }
    }

    fn job_header(&self, job: &JobSheet) {
        println!(
            "  {}  {}  {}  v{}",
            self.cyan.apply_to(&job.job_number),
            self.state(job.state),
            job.priority,
            job.version
        );
        println!(
            "  {} customer {}  device {}  technician {}",
            self.dim.apply_to(&job.id),
            job.customer_ref,
            job.device_ref,
            job.technician_ref.as_deref().unwrap_or("-")
        );
        if let Some(cancellation) = &job.cancellation {
            println!(
                "  {} by {}: {}",
                self.red.apply_to("cancelled"),
                cancellation.cancelled_by,
                cancellation.reason
            );
        }
    }

    fn next_steps(&self, next: &[JobState], pending: &[DocumentationRequirement]) {
        if !next.is_empty() {
            let next: Vec<String> = next.iter().map(|s| self.state(*s)).collect();
            println!("  next: {}", next.join(", "));
        }
        if !pending.is_empty() {
            let pending: Vec<String> = pending.iter().map(ToString::to_string).collect();
            println!("  {} {}", self.yellow.apply_to("pending:"), pending.join(", "));
        }
    }
}
