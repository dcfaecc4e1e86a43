//! Prometheus metrics registration and export.
//!
//! Every controller owns its own `PipelineMetrics` with a private
//! `Registry`, so two pipelines in one process never share counters.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Metrics of one pipeline instance.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    /// Tasks accepted by `submit`.
    pub(crate) tasks_submitted: IntCounter,
    /// Terminal task outcomes, labeled by outcome.
    pub(crate) tasks_total: IntCounterVec,
    /// Attempts re-offered after a retryable failure.
    pub(crate) task_retries: IntCounter,
    /// Wall time of individual attempts.
    pub(crate) task_duration: Histogram,
    /// Workers currently running an attempt.
    pub(crate) active_workers: IntGauge,
    /// Pending work, labeled by stage (`buffer`, `scheduler`).
    pub(crate) queue_depth: IntGaugeVec,
    /// Admission leases currently held.
    pub(crate) leases_outstanding: IntGauge,
}

impl PipelineMetrics {
    /// Creates the metrics and registers them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_submitted = IntCounter::new(
            "workline_tasks_submitted_total",
            "Total number of tasks accepted for execution",
        )?;

        let tasks_total = IntCounterVec::new(
            Opts::new("workline_tasks_total", "Total number of tasks finished"),
            &["outcome"],
        )?;

        let task_retries = IntCounter::new(
            "workline_task_retries_total",
            "Total number of attempts re-offered after a failure",
        )?;

        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "workline_task_duration_seconds",
                "Duration of a single task attempt in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let active_workers =
            IntGauge::new("workline_active_workers", "Number of workers running a task")?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("workline_queue_depth", "Number of tasks waiting for a worker"),
            &["stage"],
        )?;

        let leases_outstanding = IntGauge::new(
            "workline_leases_outstanding",
            "Number of admission permits currently leased",
        )?;

        registry.register(Box::new(tasks_submitted.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_retries.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(leases_outstanding.clone()))?;

        Ok(Self {
            registry,
            tasks_submitted,
            tasks_total,
            task_retries,
            task_duration,
            active_workers,
            queue_depth,
            leases_outstanding,
        })
    }

    /// The registry backing these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all registered metrics in Prometheus text format.
    ///
    /// Encoding failures are reported inline as a comment line.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("tasks_submitted", &self.tasks_submitted.get())
            .field("active_workers", &self.active_workers.get())
            .finish_non_exhaustive()
    }
}
