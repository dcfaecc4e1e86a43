//! workline: a bounded concurrent job pipeline.
//!
//! Work is admitted under a permit limit, buffered in a fixed-size queue,
//! scheduled by priority, executed with retry, timeout and progress
//! reporting, and drained through a worker pool with graceful and forceful
//! shutdown.
//!
//! ```rust,ignore
//! use workline::{PipelineConfig, PipelineController, Priority, TaskContext, WorkFailure};
//!
//! let controller = PipelineController::start(PipelineConfig::default())?;
//! let handle = controller
//!     .submit(|_ctx: TaskContext| async { Ok::<_, WorkFailure>(42) }, Priority::High, None)
//!     .await?;
//! assert_eq!(handle.wait().await?, 42);
//! controller.shutdown();
//! ```

pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used types
pub use error::{Operation, PipelineError, ProtocolViolation, Resource, Result};
pub use pipeline::{ConfigError, PipelineConfig, PipelineController, PipelineState};
pub use scheduler::{
    CancelReason, DiscardedItem, PermitLease, PoolStats, Priority, ProgressUpdate, RetryPolicy,
    TaskContext, TaskHandle, TaskId, TaskState, Work, WorkFailure,
};
