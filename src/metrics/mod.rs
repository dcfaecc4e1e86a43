//! Metrics module for Prometheus-based monitoring.
//!
//! Each pipeline owns a `PipelineMetrics` with its own registry. Workers
//! and the executor record task flow through it, the controller exports it
//! in Prometheus text format and derives `PoolStats` from its counters.
//!
//! # Example
//!
//! ```ignore
//! use workline::metrics::PipelineMetrics;
//!
//! let metrics = PipelineMetrics::new()?;
//! let text = metrics.export();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsSnapshot;
pub use prometheus::PipelineMetrics;
