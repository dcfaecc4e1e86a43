//! Error types for workline operations.
//!
//! Every outcome a caller has to handle is an explicit variant:
//! - Transient conditions (`CapacityExceeded`, `Timeout`) the caller may retry
//! - Lifecycle rejections (`Rejected`, `Closed`)
//! - Terminal task outcomes (`Cancelled`, `RetryExhausted`, `TaskFailed`)
//! - Contract breaches by the caller (`ProtocolViolation`)
//! - Setup failures (`Config`, `Metrics`)

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::config::ConfigError;
use crate::pipeline::state::PipelineState;
use crate::scheduler::gate::LeaseId;
use crate::scheduler::job::{CancelReason, TaskId, TaskState};
use crate::scheduler::retry::WorkFailure;

/// Bounded resources a caller can run out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Admission permits of the gate.
    Permits,
    /// Slots of the bounded buffer.
    Buffer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Permits => write!(f, "admission permits"),
            Resource::Buffer => write!(f, "buffer slots"),
        }
    }
}

/// Operations that can time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AcquirePermit,
    Enqueue,
    GetResult,
    Shutdown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::AcquirePermit => write!(f, "permit acquisition"),
            Operation::Enqueue => write!(f, "enqueue"),
            Operation::GetResult => write!(f, "result retrieval"),
            Operation::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Breaches of the pipeline's usage contract.
///
/// These indicate a bug in the calling code and are always reported.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("lease {lease} was issued by a different admission gate")]
    ForeignLease { lease: LeaseId },

    #[error("result slot of task {task_id} is already terminal ({state})")]
    SlotAlreadyTerminal { task_id: TaskId, state: TaskState },

    #[error("{operation} attempted after the pipeline stopped")]
    AfterStop { operation: &'static str },
}

/// Top-level error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Capacity exceeded: no {resource} available")]
    CapacityExceeded { resource: Resource },

    #[error("Pipeline is {state} and rejects new work")]
    Rejected { state: PipelineState },

    #[error("{resource} closed")]
    Closed { resource: Resource },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: Operation, after: Duration },

    #[error("Task {task_id} cancelled: {reason}")]
    Cancelled { task_id: TaskId, reason: CancelReason },

    #[error("Task {task_id} failed after {attempts} attempts")]
    RetryExhausted {
        task_id: TaskId,
        attempts: u32,
        #[source]
        cause: WorkFailure,
    },

    #[error("Task {task_id} failed on attempt {attempts} with a non-retryable error")]
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        #[source]
        cause: WorkFailure,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl PipelineError {
    /// Returns whether the caller may retry or fall back to a timed wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::CapacityExceeded { .. } | PipelineError::Timeout { .. }
        )
    }

    /// Returns whether this error reports a breach of the usage contract.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::ProtocolViolation(_))
    }

    /// Returns whether the pipeline refused the work because of its lifecycle.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::Rejected { .. } | PipelineError::Closed { .. }
        )
    }

    /// Returns the underlying work failure for failed tasks.
    pub fn work_failure(&self) -> Option<&WorkFailure> {
        match self {
            PipelineError::RetryExhausted { cause, .. } | PipelineError::TaskFailed { cause, .. } => {
                Some(cause)
            }
            _ => None,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
