//! Lifecycle of a pipeline controller.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state: `Running → Draining → Stopped`.
///
/// `Running → Stopped` is the forceful path. Nothing leaves `Stopped` and
/// nothing returns to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Accepting, scheduling and executing work.
    Running,
    /// Rejecting new admissions, finishing queued and in-flight work.
    Draining,
    /// No task may be admitted, scheduled or executed.
    Stopped,
}

impl PipelineState {
    pub fn accepts_work(self) -> bool {
        self == PipelineState::Running
    }

    pub fn is_stopped(self) -> bool {
        self == PipelineState::Stopped
    }

    /// Returns whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::Running, PipelineState::Draining)
                | (PipelineState::Running, PipelineState::Stopped)
                | (PipelineState::Draining, PipelineState::Stopped)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}
