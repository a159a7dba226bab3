use std::collections::BTreeMap;

use serde::Serialize;

use crate::state_machine::{JobSheet, JobState, Priority};

/// Aggregate workflow figures over a set of jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowAnalytics {
    pub total_jobs: usize,
    /// Jobs not yet delivered or cancelled.
    pub active_jobs: usize,
    pub counts_by_state: BTreeMap<JobState, usize>,
    pub urgent_active: usize,
    pub delivered: usize,
    pub cancelled: usize,
    /// Mean intake-to-completion time over jobs that reached COMPLETED.
    pub average_cycle_time_hours: Option<f64>,
    /// Delivered jobs as a share of jobs that reached a terminal state.
    pub delivery_rate: Option<f64>,
}

impl WorkflowAnalytics {
    pub fn compute(jobs: &[JobSheet]) -> Self {
        let mut analytics = WorkflowAnalytics {
            total_jobs: jobs.len(),
            ..Default::default()
        };
        let mut cycle_hours = Vec::new();

        for job in jobs {
            *analytics.counts_by_state.entry(job.state).or_default() += 1;
            match job.state {
                JobState::Delivered => analytics.delivered += 1,
                JobState::Cancelled => analytics.cancelled += 1,
                _ => {
                    analytics.active_jobs += 1;
                    if job.priority == Priority::Urgent {
                        analytics.urgent_active += 1;
                    }
                }
            }
            if let Some(cycle) = job.cycle_time() {
                cycle_hours.push(cycle.num_seconds() as f64 / 3600.0);
            }
        }

        if !cycle_hours.is_empty() {
            analytics.average_cycle_time_hours =
                Some(cycle_hours.iter().sum::<f64>() / cycle_hours.len() as f64);
        }
        let finished = analytics.delivered + analytics.cancelled;
        if finished > 0 {
            analytics.delivery_rate = Some(analytics.delivered as f64 / finished as f64);
        }
        analytics
    }

    pub fn count(&self, state: JobState) -> usize {
        self.counts_by_state.get(&state).copied().unwrap_or(0)
    }
}
