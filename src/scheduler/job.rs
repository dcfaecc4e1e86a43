//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Priority`: Scheduling class of a task
//! - `TaskId`: Stable identifier of a submitted task
//! - `TaskState`: Lifecycle of a task (`Pending → Running → terminal`)
//! - `WorkItem`: An immutable queue entry handed from producers to workers
//! - `DiscardedItem`: What `shutdown_now` hands back for never-started work

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::executor::ErasedTask;
use super::queue::Schedulable;

/// Scheduling class of a task.
///
/// Classes are strictly ordered: a `Low` task is only served when no `High`
/// or `Normal` task is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank of the class; lower ranks are served first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Unique identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion state of a task.
///
/// Transitions are monotonic: `Pending → Running → {Succeeded, Failed,
/// Cancelled}`, with `Pending → Cancelled` for work cancelled before it
/// started. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Returns whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match self {
            TaskState::Pending => matches!(next, TaskState::Running | TaskState::Cancelled),
            TaskState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task ended up `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled the handle.
    Requested,
    /// A bounded `get_result` expired and cancelled the task.
    Timeout,
    /// The pipeline was force-stopped while the task was in flight.
    Shutdown,
    /// The task was still queued when the pipeline was force-stopped.
    Discarded,
    /// The submission was dropped or refused before the task was queued.
    Abandoned,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "result wait timed out"),
            CancelReason::Shutdown => write!(f, "pipeline shut down"),
            CancelReason::Discarded => write!(f, "discarded from queue"),
            CancelReason::Abandoned => write!(f, "abandoned before admission"),
        }
    }
}

/// A queued unit of work.
///
/// Work items are created when a task is enqueued (and again each time a
/// retry is re-offered) and are never mutated afterwards. The arrival
/// sequence is the tie-break within a priority class.
#[derive(Clone)]
pub struct WorkItem {
    task: Arc<dyn ErasedTask>,
    priority: Priority,
    arrival: u64,
    enqueued_at: DateTime<Utc>,
}

impl WorkItem {
    pub(crate) fn new(task: Arc<dyn ErasedTask>, priority: Priority, arrival: u64) -> Self {
        Self {
            task,
            priority,
            arrival,
            enqueued_at: Utc::now(),
        }
    }

    /// Identifier of the task this item carries.
    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    /// Scheduling class used for this item.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Arrival sequence assigned when the item was enqueued.
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    /// Wall-clock time the item was enqueued.
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub(crate) fn task(&self) -> &Arc<dyn ErasedTask> {
        &self.task
    }

    pub(crate) fn into_discarded(self) -> DiscardedItem {
        DiscardedItem {
            task_id: self.task.id(),
            priority: self.task.priority(),
            attempts: self.task.attempts(),
            arrival: self.arrival,
            enqueued_at: self.enqueued_at,
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("task_id", &self.task.id())
            .field("priority", &self.priority)
            .field("arrival", &self.arrival)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

impl Schedulable for WorkItem {
    fn task_id(&self) -> TaskId {
        self.task.id()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn arrival(&self) -> u64 {
        self.arrival
    }
}

/// A queued task that was dropped by a forceful shutdown before it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedItem {
    /// ID of the discarded task.
    pub task_id: TaskId,
    /// Priority class the task was submitted with.
    pub priority: Priority,
    /// Attempts made before the task was discarded (non-zero only for retries).
    pub attempts: u32,
    /// Arrival sequence of the queue entry.
    pub arrival: u64,
    /// When the queue entry was created.
    pub enqueued_at: DateTime<Utc>,
}
