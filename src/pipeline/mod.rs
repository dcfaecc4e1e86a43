//! Pipeline lifecycle and configuration.
//!
//! A `PipelineController` owns one pipeline: its executor, its worker pool
//! and its lifecycle state.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──shutdown()──► Draining ──drained──► Stopped
//!    │                                            ▲
//!    └───────────────shutdown_now()───────────────┘
//! ```
//!
//! - **Running**: accepts work
//! - **Draining**: rejects new work; queued tasks, retries and host-held
//!   leases are allowed to finish
//! - **Stopped**: terminal; workers have been told to exit
//!
//! # Configuration
//!
//! ```rust,ignore
//! // Via builder pattern
//! let config = PipelineConfig::new()
//!     .with_worker_count(8)
//!     .with_permit_count(32)
//!     .with_retry(5, Duration::from_millis(250));
//!
//! // File, then environment overrides
//! let config = PipelineConfig::load(Some(Path::new("workline.yaml")))?;
//! ```

pub mod config;
pub mod controller;
pub mod state;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig, RetryConfig, SchedulingMode};
pub use controller::PipelineController;
pub use state::PipelineState;
