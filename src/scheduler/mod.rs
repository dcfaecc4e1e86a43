//! Concurrent task execution with bounded admission and priority scheduling.
//!
//! This module provides the building blocks of a pipeline:
//!
//! - **AdmissionGate**: Counting gate bounding in-flight work, handing out leases
//! - **BoundedBuffer**: Fixed-capacity FIFO between producers and workers
//! - **PriorityScheduler**: Orders pending work by priority class, then arrival
//! - **TaskExecutor**: Submission, retry, timeout, cancellation and progress
//! - **WorkerPool**: Workers that pull from the scheduler and run attempts
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      └──────┬───────┘
//!                             │ lease
//!                      ┌──────▼───────┐
//!                      │AdmissionGate │
//!                      └──────┬───────┘
//!                      ┌──────▼───────┐
//!                      │BoundedBuffer │
//!                      └──────┬───────┘
//!                      ┌──────▼───────┐
//!                      │  Scheduler   │◄──── retries
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! Most callers go through `pipeline::PipelineController`, which wires
//! these together and owns the lifecycle.

pub mod buffer;
pub mod executor;
pub mod gate;
pub mod job;
pub mod queue;
pub mod retry;
pub mod worker_pool;

// Re-export main types for convenience
pub use buffer::{BoundedBuffer, TryPutError};
pub use executor::{ProgressCallback, ProgressUpdate, TaskContext, TaskExecutor, TaskHandle, Work};
pub use gate::{AdmissionGate, LeaseId, PermitLease};
pub use job::{CancelReason, DiscardedItem, Priority, TaskId, TaskState, WorkItem};
pub use queue::{OfferError, PriorityScheduler, Schedulable, ScheduleKey};
pub use retry::{FailureKind, RetryPolicy, WorkFailure};
pub use worker_pool::{PoolStats, Worker, WorkerPool};
