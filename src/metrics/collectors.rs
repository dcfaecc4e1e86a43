//! Recording helpers over `PipelineMetrics`.
//!
//! Scheduler code records through these methods so that label values stay
//! consistent, and reads counters back through `MetricsSnapshot`.

use std::time::Duration;

use crate::scheduler::job::TaskState;

use super::prometheus::PipelineMetrics;

/// Point-in-time copy of the counters behind `PoolStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub active_workers: u64,
    pub attempts_observed: u64,
    pub attempt_seconds_total: f64,
}

impl MetricsSnapshot {
    /// Mean attempt duration, zero before any attempt finished.
    pub fn average_attempt_duration(&self) -> Duration {
        if self.attempts_observed == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.attempt_seconds_total / self.attempts_observed as f64)
    }
}

impl PipelineMetrics {
    pub(crate) fn record_submitted(&self) {
        self.tasks_submitted.inc();
    }

    /// Record a task reaching a terminal state.
    pub(crate) fn record_outcome(&self, state: TaskState) {
        if state.is_terminal() {
            self.tasks_total
                .with_label_values(&[state.to_string().as_str()])
                .inc();
        }
    }

    pub(crate) fn record_retry(&self) {
        self.task_retries.inc();
    }

    pub(crate) fn record_attempt(&self, elapsed: Duration) {
        self.task_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn worker_busy(&self) {
        self.active_workers.inc();
    }

    pub(crate) fn worker_idle(&self) {
        self.active_workers.dec();
    }

    /// Refresh the gauges that mirror queue and gate occupancy.
    pub(crate) fn observe_occupancy(&self, buffered: usize, scheduled: usize, leases: usize) {
        self.queue_depth
            .with_label_values(&["buffer"])
            .set(buffered as i64);
        self.queue_depth
            .with_label_values(&["scheduler"])
            .set(scheduled as i64);
        self.leases_outstanding.set(leases as i64);
    }

    fn outcome_count(&self, state: TaskState) -> u64 {
        self.tasks_total
            .with_label_values(&[state.to_string().as_str()])
            .get()
    }

    /// Read the counters back.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.tasks_submitted.get(),
            succeeded: self.outcome_count(TaskState::Succeeded),
            failed: self.outcome_count(TaskState::Failed),
            cancelled: self.outcome_count(TaskState::Cancelled),
            retries: self.task_retries.get(),
            active_workers: self.active_workers.get().max(0) as u64,
            attempts_observed: self.task_duration.get_sample_count(),
            attempt_seconds_total: self.task_duration.get_sample_sum(),
        }
    }
}
