//! Task execution: handles, result slots, retries and progress.
//!
//! Submitting work creates a task cell that owns the work, its retry policy,
//! its admission lease and a write-once result slot. The cell travels through
//! the pipeline as a type-erased `WorkItem`:
//!
//! ```text
//! submit ─► AdmissionGate ─► BoundedBuffer ─► PriorityScheduler ─► worker
//!                ▲                                    ▲              │
//!                │                                    └── retry ◄────┤
//!                └──────────────── lease released ◄── terminal ◄─────┘
//! ```
//!
//! Retries are not run inline: after the policy delay the task is re-offered
//! to the scheduler with a fresh arrival sequence and competes with other
//! pending work. Cancellation is cooperative. The result slot accepts exactly
//! one terminal outcome, so a late result racing a cancellation is rejected.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{Operation, PipelineError, ProtocolViolation};
use crate::metrics::PipelineMetrics;
use crate::pipeline::config::{PipelineConfig, SchedulingMode};
use crate::pipeline::state::PipelineState;

use super::buffer::{BoundedBuffer, TryPutError};
use super::gate::{AdmissionGate, PermitLease};
use super::job::{CancelReason, DiscardedItem, Priority, TaskId, TaskState, WorkItem};
use super::queue::{OfferError, PriorityScheduler};
use super::retry::{RetryPolicy, WorkFailure};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A unit of work the pipeline can run.
///
/// Implemented for every `Fn(TaskContext) -> impl Future<Output = Result<T,
/// WorkFailure>>`, so closures returning `async move` blocks can be submitted
/// directly. The work may be run more than once when its retry policy allows.
#[async_trait]
pub trait Work<T>: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext) -> Result<T, WorkFailure>;
}

#[async_trait]
impl<T, F, Fut> Work<T> for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, WorkFailure>> + Send + 'static,
    T: Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> Result<T, WorkFailure> {
        (self)(ctx).await
    }
}

/// Cooperative cancellation flag shared by a task and its attempts.
#[derive(Debug, Default)]
pub(crate) struct CancelFlag {
    set: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        if !self.set.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Intermediate progress, always below 100.
    Percent(u8),
    /// Final notice: the task succeeded (100%).
    Completed,
    /// Final notice: the task failed or was cancelled.
    Aborted(String),
}

impl ProgressUpdate {
    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressUpdate::Percent(p) => Some(*p),
            ProgressUpdate::Completed => Some(100),
            ProgressUpdate::Aborted(_) => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, ProgressUpdate::Percent(_))
    }
}

/// Callback receiving progress notifications.
pub type ProgressCallback = Arc<dyn Fn(TaskId, ProgressUpdate) + Send + Sync>;

/// Delivers progress and guarantees exactly one final notice.
///
/// The callback runs under the tracker's lock so that no intermediate
/// update can be observed after the final one. It must not block. A
/// panicking callback is logged and otherwise ignored.
struct ProgressTracker {
    task_id: TaskId,
    callback: ProgressCallback,
    finished: Mutex<bool>,
}

impl ProgressTracker {
    fn new(task_id: TaskId, callback: ProgressCallback) -> Self {
        Self {
            task_id,
            callback,
            finished: Mutex::new(false),
        }
    }

    fn advance(&self, percent: u8) {
        let finished = lock(&self.finished);
        if !*finished {
            self.notify(ProgressUpdate::Percent(percent.min(99)));
        }
    }

    fn finish(&self, update: ProgressUpdate) -> bool {
        let mut finished = lock(&self.finished);
        if *finished {
            return false;
        }
        *finished = true;
        self.notify(update);
        true
    }

    fn notify(&self, update: ProgressUpdate) {
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            (self.callback)(self.task_id, update)
        }));
        if let Err(payload) = delivered {
            error!(
                task_id = %self.task_id,
                panic = %panic_message(payload.as_ref()),
                "Progress callback panicked"
            );
        }
    }
}

/// What a running attempt can see of its task.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    attempt: u32,
    max_attempts: u32,
    cancel: Arc<CancelFlag>,
    progress: Option<Arc<ProgressTracker>>,
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation checkpoint: returns an interrupted failure once the task
    /// has been cancelled, so work can bail out with `?`.
    pub fn checkpoint(&self) -> Result<(), WorkFailure> {
        if self.cancel.is_cancelled() {
            Err(WorkFailure::interrupted())
        } else {
            Ok(())
        }
    }

    /// Resolves when the task is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Reports intermediate progress; values are clamped to 0..=99.
    pub fn report_progress(&self, percent: u8) {
        if let Some(progress) = &self.progress {
            progress.advance(percent);
        }
    }

    /// Reports progress as `step` out of `total` steps.
    pub fn report_step(&self, step: u32, total: u32) {
        if total == 0 {
            return;
        }
        let percent = u64::from(step.min(total)) * 100 / u64::from(total);
        self.report_progress(percent as u8);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Terminal outcome stored in a result slot.
#[derive(Debug, Clone)]
pub(crate) enum TaskOutcome<T> {
    Succeeded(T),
    Failed {
        exhausted: bool,
        attempts: u32,
        cause: WorkFailure,
    },
    Cancelled(CancelReason),
}

impl<T> TaskOutcome<T> {
    fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded(_) => TaskState::Succeeded,
            TaskOutcome::Failed { .. } => TaskState::Failed,
            TaskOutcome::Cancelled(_) => TaskState::Cancelled,
        }
    }

    fn into_result(self, task_id: TaskId) -> Result<T, PipelineError> {
        match self {
            TaskOutcome::Succeeded(value) => Ok(value),
            TaskOutcome::Failed {
                exhausted: true,
                attempts,
                cause,
            } => Err(PipelineError::RetryExhausted {
                task_id,
                attempts,
                cause,
            }),
            TaskOutcome::Failed {
                exhausted: false,
                attempts,
                cause,
            } => Err(PipelineError::TaskFailed {
                task_id,
                attempts,
                cause,
            }),
            TaskOutcome::Cancelled(reason) => Err(PipelineError::Cancelled { task_id, reason }),
        }
    }
}

struct SlotInner<T> {
    state: TaskState,
    outcome: Option<TaskOutcome<T>>,
}

/// Write-once result slot with an observable state.
pub(crate) struct ResultSlot<T> {
    task_id: TaskId,
    inner: Mutex<SlotInner<T>>,
    state_tx: watch::Sender<TaskState>,
}

impl<T> ResultSlot<T> {
    fn new(task_id: TaskId) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Pending);
        Self {
            task_id,
            inner: Mutex::new(SlotInner {
                state: TaskState::Pending,
                outcome: None,
            }),
            state_tx,
        }
    }

    fn state(&self) -> TaskState {
        lock(&self.inner).state
    }

    /// Moves `Pending` to `Running`. Returns false once terminal.
    fn mark_running(&self) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            TaskState::Pending => {
                inner.state = TaskState::Running;
                self.state_tx.send_replace(TaskState::Running);
                true
            }
            TaskState::Running => true,
            _ => false,
        }
    }

    /// Stores the terminal outcome. A second write is refused.
    fn complete(&self, outcome: TaskOutcome<T>) -> Result<TaskState, ProtocolViolation> {
        let mut inner = lock(&self.inner);
        let next = outcome.state();
        if !inner.state.can_transition_to(next) {
            return Err(ProtocolViolation::SlotAlreadyTerminal {
                task_id: self.task_id,
                state: inner.state,
            });
        }
        inner.state = next;
        inner.outcome = Some(outcome);
        self.state_tx.send_replace(next);
        Ok(next)
    }

    fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }
}

impl<T: Clone> ResultSlot<T> {
    fn outcome(&self) -> Option<TaskOutcome<T>> {
        lock(&self.inner).outcome.clone()
    }
}

/// Result of one pass of a worker over a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    /// The attempt wrote the task's terminal state.
    Finished(TaskState),
    /// The attempt failed and the policy allows another after `delay`.
    Retry { delay: Duration },
    /// The attempt ran but the task had already been cancelled.
    Superseded,
    /// The task was terminal before the attempt started.
    Skipped,
}

/// Type-erased view of a task, as carried by `WorkItem`.
#[async_trait]
pub(crate) trait ErasedTask: Send + Sync {
    fn id(&self) -> TaskId;
    fn priority(&self) -> Priority;
    fn attempts(&self) -> u32;
    fn state(&self) -> TaskState;
    fn cancel_flag(&self) -> Arc<CancelFlag>;
    /// Writes `Cancelled` unless already terminal. Returns whether it did.
    fn cancel(&self, reason: CancelReason) -> bool;
    /// Hands back the lease unless an attempt is running.
    fn release_if_idle(&self) -> Option<PermitLease>;
    async fn run_attempt(&self, worker_id: &str) -> AttemptOutcome;
}

#[derive(Default)]
struct AttemptGuard {
    active: bool,
    lease: Option<PermitLease>,
}

/// A submitted task and everything needed to run and settle it.
pub(crate) struct TaskCell<T> {
    id: TaskId,
    priority: Priority,
    submitted_at: DateTime<Utc>,
    work: Box<dyn Work<T>>,
    policy: Arc<RetryPolicy>,
    attempts: AtomicU32,
    cancel: Arc<CancelFlag>,
    slot: ResultSlot<T>,
    guard: Mutex<AttemptGuard>,
    progress: Option<Arc<ProgressTracker>>,
}

impl<T: Send + 'static> TaskCell<T> {
    fn new(
        work: Box<dyn Work<T>>,
        priority: Priority,
        policy: Arc<RetryPolicy>,
        lease: PermitLease,
        progress: Option<ProgressCallback>,
    ) -> Self {
        let id = TaskId::new();
        Self {
            id,
            priority,
            submitted_at: Utc::now(),
            work,
            policy,
            attempts: AtomicU32::new(0),
            cancel: Arc::new(CancelFlag::default()),
            slot: ResultSlot::new(id),
            guard: Mutex::new(AttemptGuard {
                active: false,
                lease: Some(lease),
            }),
            progress: progress.map(|callback| Arc::new(ProgressTracker::new(id, callback))),
        }
    }

    fn begin_attempt(&self) -> bool {
        let released = {
            let mut guard = lock(&self.guard);
            if self.slot.mark_running() {
                guard.active = true;
                return true;
            }
            guard.lease.take()
        };
        drop(released);
        false
    }

    fn end_attempt(&self) {
        let released = {
            let mut guard = lock(&self.guard);
            guard.active = false;
            if self.slot.state().is_terminal() {
                guard.lease.take()
            } else {
                None
            }
        };
        drop(released);
    }

    fn settle(&self, outcome: TaskOutcome<T>, worker_id: &str) -> AttemptOutcome {
        let final_update = match &outcome {
            TaskOutcome::Succeeded(_) => ProgressUpdate::Completed,
            TaskOutcome::Failed { cause, .. } => ProgressUpdate::Aborted(cause.to_string()),
            TaskOutcome::Cancelled(reason) => ProgressUpdate::Aborted(reason.to_string()),
        };
        match self.slot.complete(outcome) {
            Ok(state) => {
                if let Some(progress) = &self.progress {
                    progress.finish(final_update);
                }
                AttemptOutcome::Finished(state)
            }
            Err(violation) => {
                if self.cancel.is_cancelled() {
                    debug!(worker_id, task_id = %self.id, "Late result rejected after cancellation");
                } else {
                    error!(worker_id, task_id = %self.id, error = %violation, "Result slot rejected a write");
                }
                AttemptOutcome::Superseded
            }
        }
    }

    fn conclude(
        &self,
        result: Result<T, WorkFailure>,
        attempt: u32,
        worker_id: &str,
    ) -> AttemptOutcome {
        let failure = match result {
            Ok(value) => return self.settle(TaskOutcome::Succeeded(value), worker_id),
            Err(failure) => failure,
        };

        if self.cancel.is_cancelled() {
            debug!(worker_id, task_id = %self.id, attempt, "Attempt ended after cancellation");
            return AttemptOutcome::Superseded;
        }

        if self.policy.should_retry(&failure, attempt) {
            warn!(
                worker_id,
                task_id = %self.id,
                attempt,
                remaining_attempts = self.policy.remaining_attempts(attempt),
                error = %failure,
                "Attempt failed, scheduling retry"
            );
            return AttemptOutcome::Retry {
                delay: self.policy.delay(),
            };
        }

        let exhausted = self.policy.is_retryable(&failure);
        warn!(
            worker_id,
            task_id = %self.id,
            attempts = attempt,
            exhausted,
            error = %failure,
            "Task failed"
        );
        self.settle(
            TaskOutcome::Failed {
                exhausted,
                attempts: attempt,
                cause: failure,
            },
            worker_id,
        )
    }
}

#[async_trait]
impl<T: Send + 'static> ErasedTask for TaskCell<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn state(&self) -> TaskState {
        self.slot.state()
    }

    fn cancel_flag(&self) -> Arc<CancelFlag> {
        Arc::clone(&self.cancel)
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        if self.slot.state().is_terminal() {
            return false;
        }
        // The flag goes first so a rejected late write can tell it lost to a cancel.
        self.cancel.cancel();
        match self.slot.complete(TaskOutcome::Cancelled(reason)) {
            Ok(_) => {
                if let Some(progress) = &self.progress {
                    progress.finish(ProgressUpdate::Aborted(reason.to_string()));
                }
                true
            }
            Err(_) => false,
        }
    }

    fn release_if_idle(&self) -> Option<PermitLease> {
        let mut guard = lock(&self.guard);
        if guard.active {
            None
        } else {
            guard.lease.take()
        }
    }

    async fn run_attempt(&self, worker_id: &str) -> AttemptOutcome {
        if !self.begin_attempt() {
            debug!(worker_id, task_id = %self.id, "Skipping task that already finished");
            return AttemptOutcome::Skipped;
        }
        let _active = ActiveAttempt(self);

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            if let Some(progress) = &self.progress {
                progress.advance(0);
            }
        }

        let ctx = TaskContext {
            task_id: self.id,
            attempt,
            max_attempts: self.policy.max_attempts(),
            cancel: Arc::clone(&self.cancel),
            progress: self.progress.clone(),
        };

        debug!(
            worker_id,
            task_id = %self.id,
            attempt,
            priority = %self.priority,
            "Attempt started"
        );

        let result = match AssertUnwindSafe(self.work.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker_id, task_id = %self.id, attempt, panic = %message, "Task panicked");
                Err(WorkFailure::permanent(format!("task panicked: {}", message)))
            }
        };

        self.conclude(result, attempt, worker_id)
    }
}

/// Ends the attempt on every exit path, unwinding included.
struct ActiveAttempt<'a, T: Send + 'static>(&'a TaskCell<T>);

impl<T: Send + 'static> Drop for ActiveAttempt<'_, T> {
    fn drop(&mut self) {
        self.0.end_attempt();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Removes a task from the live set unless the submission completed.
///
/// An abandoned submission still settles its task, so a progress callback
/// gets its final notice.
struct Registration<'a> {
    core: &'a ExecutorCore,
    id: TaskId,
    committed: bool,
}

impl Registration<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let removed = lock(&self.core.live).remove(&self.id);
        if let Some(task) = removed {
            if task.cancel(CancelReason::Abandoned) {
                debug!(task_id = %self.id, "Submission abandoned before admission");
            }
            drop(task.release_if_idle());
        }
    }
}

/// State shared by the executor, its handles and the workers.
pub(crate) struct ExecutorCore {
    buffer: BoundedBuffer<WorkItem>,
    scheduler: PriorityScheduler<WorkItem>,
    gate: AdmissionGate,
    lifecycle: watch::Sender<PipelineState>,
    metrics: PipelineMetrics,
    scheduling: SchedulingMode,
    default_policy: Arc<RetryPolicy>,
    result_timeout: Duration,
    arrivals: AtomicU64,
    live: Mutex<HashMap<TaskId, Arc<dyn ErasedTask>>>,
}

impl ExecutorCore {
    fn new(config: &PipelineConfig, metrics: PipelineMetrics) -> Self {
        let (lifecycle, _) = watch::channel(PipelineState::Running);
        Self {
            buffer: BoundedBuffer::new(config.buffer_capacity),
            scheduler: PriorityScheduler::new(),
            gate: AdmissionGate::new(config.permit_count),
            lifecycle,
            metrics,
            scheduling: config.scheduling,
            default_policy: Arc::new(config.retry.to_policy()),
            result_timeout: config.result_timeout,
            arrivals: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn state(&self) -> PipelineState {
        *self.lifecycle.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.lifecycle.subscribe()
    }

    pub(crate) fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub(crate) fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn scheduled(&self) -> usize {
        self.scheduler.len()
    }

    /// Buffer slots in use, counting tasks already moved to the scheduler.
    pub(crate) fn queued(&self) -> usize {
        self.buffer.occupied()
    }

    pub(crate) fn rejection(&self) -> PipelineError {
        PipelineError::Rejected {
            state: self.state(),
        }
    }

    /// Error for a call made while the pipeline does not accept work.
    ///
    /// Draining refuses politely; calling in after the stop is a contract
    /// breach.
    pub(crate) fn refusal(&self, operation: &'static str) -> PipelineError {
        match self.state() {
            PipelineState::Stopped => {
                error!(operation, "Called after the pipeline stopped");
                ProtocolViolation::AfterStop { operation }.into()
            }
            state => PipelineError::Rejected { state },
        }
    }

    fn ensure_accepting(&self, operation: &'static str) -> Result<(), PipelineError> {
        if self.state().accepts_work() {
            Ok(())
        } else {
            Err(self.refusal(operation))
        }
    }

    fn effective_priority(&self, priority: Priority) -> Priority {
        match self.scheduling {
            SchedulingMode::Priority => priority,
            SchedulingMode::Fifo => Priority::Normal,
        }
    }

    fn next_arrival(&self) -> u64 {
        self.arrivals.fetch_add(1, Ordering::SeqCst)
    }

    fn forget(&self, id: TaskId) {
        lock(&self.live).remove(&id);
    }

    fn register(&self, task: Arc<dyn ErasedTask>) -> Registration<'_> {
        let id = task.id();
        lock(&self.live).insert(id, task);
        Registration {
            core: self,
            id,
            committed: false,
        }
    }

    /// Moves the pipeline to `next` if the transition is legal.
    pub(crate) fn transition(&self, next: PipelineState) -> bool {
        let mut previous = next;
        let changed = self.lifecycle.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = *state;
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(from = %previous, to = %next, "Pipeline state changed");
        }
        changed
    }

    fn close_all(&self) {
        self.gate.close();
        self.buffer.close();
        self.scheduler.close();
    }

    /// Starts a graceful drain. Returns false if already draining or stopped.
    pub(crate) fn begin_drain(&self) -> bool {
        let changed = self.transition(PipelineState::Draining);
        if changed {
            self.gate.close();
        }
        self.try_finish_drain();
        changed
    }

    /// Completes a drain once nothing is queued and no lease is held.
    ///
    /// Returns whether the pipeline is stopped.
    pub(crate) fn try_finish_drain(&self) -> bool {
        match self.state() {
            PipelineState::Stopped => true,
            PipelineState::Running => false,
            PipelineState::Draining => {
                if !self.buffer.is_empty()
                    || !self.scheduler.is_empty()
                    || self.gate.outstanding() > 0
                {
                    return false;
                }
                if self.transition(PipelineState::Stopped) {
                    self.close_all();
                    info!("Pipeline drained");
                }
                true
            }
        }
    }

    /// Stops immediately, cancelling in-flight work and returning queued work.
    pub(crate) fn shutdown_now(&self) -> Vec<DiscardedItem> {
        if !self.transition(PipelineState::Stopped) {
            return Vec::new();
        }
        self.close_all();

        let mut pending = self.scheduler.drain();
        for _ in &pending {
            self.buffer.release_held();
        }
        pending.extend(self.buffer.drain());

        let mut discarded = Vec::with_capacity(pending.len());
        for item in pending {
            if self.cancel(item.task().as_ref(), CancelReason::Discarded) {
                discarded.push(item.into_discarded());
            }
        }

        let in_flight: Vec<Arc<dyn ErasedTask>> = lock(&self.live).values().cloned().collect();
        let mut interrupted = 0usize;
        for task in in_flight {
            if self.cancel(task.as_ref(), CancelReason::Shutdown) {
                interrupted += 1;
            }
        }

        warn!(
            discarded = discarded.len(),
            interrupted,
            "Pipeline stopped forcefully"
        );
        discarded
    }

    /// Cancels a task, unqueues it and releases its lease if no attempt runs.
    pub(crate) fn cancel(&self, task: &dyn ErasedTask, reason: CancelReason) -> bool {
        if !task.cancel(reason) {
            return false;
        }
        let id = task.id();
        let unqueued = self.scheduler.remove(id).is_some();
        if unqueued {
            self.buffer.release_held();
        }
        drop(task.release_if_idle());
        self.forget(id);
        self.metrics.record_outcome(TaskState::Cancelled);
        debug!(task_id = %id, reason = %reason, unqueued, "Task cancelled");
        self.try_finish_drain();
        true
    }

    fn build<T, W>(
        &self,
        work: W,
        priority: Priority,
        policy: Option<RetryPolicy>,
        lease: PermitLease,
        progress: Option<ProgressCallback>,
    ) -> Arc<TaskCell<T>>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        let policy = policy
            .map(Arc::new)
            .unwrap_or_else(|| Arc::clone(&self.default_policy));
        Arc::new(TaskCell::new(
            Box::new(work),
            priority,
            policy,
            lease,
            progress,
        ))
    }

    fn work_item(&self, task: Arc<dyn ErasedTask>) -> WorkItem {
        let priority = self.effective_priority(task.priority());
        WorkItem::new(task, priority, self.next_arrival())
    }

    async fn submit<T, W>(
        self: &Arc<Self>,
        work: W,
        priority: Priority,
        policy: Option<RetryPolicy>,
        progress: Option<ProgressCallback>,
    ) -> Result<TaskHandle<T>, PipelineError>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        self.ensure_accepting("submit")?;
        let lease = match self.gate.acquire().await {
            Ok(lease) => lease,
            Err(PipelineError::Closed { .. }) => return Err(self.rejection()),
            Err(e) => return Err(e),
        };

        let cell = self.build(work, priority, policy, lease, progress);
        let task: Arc<dyn ErasedTask> = cell.clone();
        let registration = self.register(Arc::clone(&task));
        if self.buffer.put(self.work_item(task)).await.is_err() {
            return Err(self.rejection());
        }
        registration.commit();

        self.metrics.record_submitted();
        debug!(task_id = %cell.id, priority = %priority, "Task submitted");
        Ok(TaskHandle {
            cell,
            core: Arc::clone(self),
        })
    }

    fn try_submit<T, W>(
        self: &Arc<Self>,
        work: W,
        priority: Priority,
        policy: Option<RetryPolicy>,
    ) -> Result<TaskHandle<T>, PipelineError>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        self.ensure_accepting("try_submit")?;
        let lease = match self.gate.try_acquire() {
            Ok(lease) => lease,
            Err(PipelineError::Closed { .. }) => return Err(self.rejection()),
            Err(e) => return Err(e),
        };

        let cell = self.build(work, priority, policy, lease, None);
        let task: Arc<dyn ErasedTask> = cell.clone();
        let registration = self.register(Arc::clone(&task));
        if let Err(err) = self.buffer.try_put(self.work_item(task)) {
            return Err(match err {
                TryPutError::Full(_) => PipelineError::from(&err),
                TryPutError::Closed(_) => self.rejection(),
            });
        }
        registration.commit();

        self.metrics.record_submitted();
        debug!(task_id = %cell.id, priority = %priority, "Task submitted");
        Ok(TaskHandle {
            cell,
            core: Arc::clone(self),
        })
    }

    /// Moves a held buffer item into the scheduler.
    ///
    /// The item keeps its buffer slot while scheduled; every path that does
    /// not end in the scheduler gives the slot back.
    fn admit(&self, item: WorkItem) {
        if item.task().state().is_terminal() {
            self.buffer.release_held();
            debug!(task_id = %item.task_id(), "Dropping finished task from buffer");
            return;
        }
        match self.scheduler.offer(item) {
            Ok(_) => {}
            Err(OfferError::Closed(item)) => {
                self.buffer.release_held();
                self.cancel(item.task().as_ref(), CancelReason::Shutdown);
            }
            Err(OfferError::Duplicate(item)) => {
                self.buffer.release_held();
                error!(task_id = %item.task_id(), "Task offered twice to the scheduler");
            }
        }
    }

    fn pump_buffer(&self) {
        while let Some(item) = self.buffer.try_take_held() {
            self.admit(item);
        }
    }

    fn poll_scheduled(&self) -> Option<WorkItem> {
        let item = self.scheduler.poll_next()?;
        self.buffer.release_held();
        Some(item)
    }

    /// Waits for the next task a worker should run.
    ///
    /// Everything buffered is moved into the scheduler first, so priority
    /// order covers all pending work. Scheduled tasks keep their buffer
    /// slot until a worker picks them, so the buffer capacity bounds all
    /// queued work. Returns `None` once the pipeline has stopped.
    pub(crate) async fn next_task(&self) -> Option<WorkItem> {
        let mut lifecycle = self.lifecycle.subscribe();
        let mut outstanding = self.gate.subscribe();

        loop {
            let offered = self.scheduler.notified();
            tokio::pin!(offered);
            offered.as_mut().enable();

            let state = *lifecycle.borrow_and_update();
            if state.is_stopped() {
                return None;
            }
            let _ = *outstanding.borrow_and_update();

            self.pump_buffer();
            if let Some(item) = self.poll_scheduled() {
                return Some(item);
            }
            if self.try_finish_drain() {
                return None;
            }

            let draining = state == PipelineState::Draining;
            tokio::select! {
                _ = &mut offered => {}
                item = self.buffer.take_held() => {
                    if let Some(item) = item {
                        self.admit(item);
                    }
                }
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                changed = outstanding.changed(), if draining => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Runs one attempt of `item` and settles the result.
    pub(crate) async fn execute(self: &Arc<Self>, item: WorkItem, worker_id: &str) {
        let task = Arc::clone(item.task());
        drop(item);

        let started = Instant::now();
        let outcome = task.run_attempt(worker_id).await;
        if outcome != AttemptOutcome::Skipped {
            self.metrics.record_attempt(started.elapsed());
        }

        match outcome {
            AttemptOutcome::Finished(state) => {
                self.metrics.record_outcome(state);
                self.forget(task.id());
                debug!(worker_id, task_id = %task.id(), state = %state, "Task finished");
            }
            AttemptOutcome::Retry { delay } => {
                self.metrics.record_retry();
                self.schedule_retry(task, delay);
            }
            AttemptOutcome::Superseded | AttemptOutcome::Skipped => {}
        }

        self.try_finish_drain();
    }

    /// Re-offers a failed task after `delay`, once a buffer slot is free.
    fn schedule_retry(self: &Arc<Self>, task: Arc<dyn ErasedTask>, delay: Duration) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let flag = task.cancel_flag();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = flag.cancelled() => {}
                }
            }
            let reserved = tokio::select! {
                reserved = core.buffer.reserve() => reserved,
                _ = flag.cancelled() => false,
            };
            core.reoffer(task, reserved);
        });
    }

    fn reoffer(&self, task: Arc<dyn ErasedTask>, reserved: bool) {
        if task.state().is_terminal() {
            if reserved {
                self.buffer.release_held();
            }
            drop(task.release_if_idle());
            self.try_finish_drain();
            return;
        }
        if !reserved {
            self.cancel(task.as_ref(), CancelReason::Shutdown);
            return;
        }
        let id = task.id();
        let item = self.work_item(Arc::clone(&task));
        match self.scheduler.offer(item) {
            Ok(_) => debug!(task_id = %id, attempts = task.attempts(), "Task re-offered for retry"),
            Err(_) => {
                self.buffer.release_held();
                self.cancel(task.as_ref(), CancelReason::Shutdown);
            }
        }
    }
}

impl fmt::Debug for ExecutorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorCore")
            .field("state", &self.state())
            .field("buffer", &self.buffer)
            .field("scheduler", &self.scheduler)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Handle to a submitted task.
///
/// Handles are cheap to clone; every clone observes the same task.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
    core: Arc<ExecutorCore>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn priority(&self) -> Priority {
        self.cell.priority
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.cell.submitted_at
    }

    pub fn state(&self) -> TaskState {
        self.cell.slot.state()
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.cell.attempts.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Watches the task's state.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.cell.slot.subscribe()
    }

    /// Requests cancellation.
    ///
    /// A queued task is removed from the scheduler and its permit released.
    /// A running attempt is signalled and its result discarded when it
    /// returns. Returns false if the task had already finished.
    pub fn cancel(&self) -> bool {
        self.core.cancel(self.cell.as_ref(), CancelReason::Requested)
    }

    async fn wait_terminal(&self) {
        let mut state = self.cell.slot.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

impl<T: Clone + Send + 'static> TaskHandle<T> {
    /// Waits up to `timeout` (or the configured default) for the outcome.
    ///
    /// On expiry the task is cancelled and `Timeout` is returned. If the task
    /// finished before the cancellation could take effect, its outcome is
    /// returned instead.
    pub async fn get_result(&self, timeout: Option<Duration>) -> Result<T, PipelineError> {
        let timeout = timeout.unwrap_or(self.core.result_timeout);
        let finished = tokio::time::timeout(timeout, self.wait_terminal())
            .await
            .is_ok();

        if !finished && self.core.cancel(self.cell.as_ref(), CancelReason::Timeout) {
            debug!(task_id = %self.cell.id, ?timeout, "Result wait expired, task cancelled");
            return Err(PipelineError::Timeout {
                operation: Operation::GetResult,
                after: timeout,
            });
        }

        self.try_result().unwrap_or(Err(PipelineError::Timeout {
            operation: Operation::GetResult,
            after: timeout,
        }))
    }

    /// Waits for the outcome without a bound.
    pub async fn wait(&self) -> Result<T, PipelineError> {
        self.wait_terminal().await;
        self.try_result().unwrap_or_else(|| Err(self.core.rejection()))
    }

    /// Returns the outcome if the task has finished.
    pub fn try_result(&self) -> Option<Result<T, PipelineError>> {
        self.cell
            .slot
            .outcome()
            .map(|outcome| outcome.into_result(self.cell.id))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("priority", &self.cell.priority)
            .field("state", &self.cell.slot.state())
            .finish()
    }
}

/// Submission front-end of a pipeline.
#[derive(Clone)]
pub struct TaskExecutor {
    core: Arc<ExecutorCore>,
}

impl TaskExecutor {
    /// Creates an executor with its own buffer, scheduler, gate and metrics.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let metrics = PipelineMetrics::new()?;
        Ok(Self {
            core: Arc::new(ExecutorCore::new(config, metrics)),
        })
    }

    pub(crate) fn core(&self) -> &Arc<ExecutorCore> {
        &self.core
    }

    /// Submits work, waiting for a permit and then for a buffer slot.
    ///
    /// Without a `policy` the configured default retry policy applies.
    pub async fn submit<T, W>(
        &self,
        work: W,
        priority: Priority,
        policy: Option<RetryPolicy>,
    ) -> Result<TaskHandle<T>, PipelineError>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        self.core.submit(work, priority, policy, None).await
    }

    /// Submits work only if a permit and a buffer slot are free right now.
    pub fn try_submit<T, W>(
        &self,
        work: W,
        priority: Priority,
        policy: Option<RetryPolicy>,
    ) -> Result<TaskHandle<T>, PipelineError>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        self.core.try_submit(work, priority, policy)
    }

    /// Like `submit`, reporting progress to `callback`.
    ///
    /// The callback sees `Percent(0)` when the first attempt starts, any
    /// intermediate reports, and exactly one final `Completed` or `Aborted`.
    pub async fn submit_with_progress<T, W, C>(
        &self,
        work: W,
        priority: Priority,
        policy: Option<RetryPolicy>,
        callback: C,
    ) -> Result<TaskHandle<T>, PipelineError>
    where
        T: Send + 'static,
        W: Work<T>,
        C: Fn(TaskId, ProgressUpdate) + Send + Sync + 'static,
    {
        self.core
            .submit(work, priority, policy, Some(Arc::new(callback)))
            .await
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("core", &self.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Resource;
    use std::sync::atomic::AtomicUsize;

    fn executor(config: PipelineConfig) -> TaskExecutor {
        TaskExecutor::new(&config).expect("executor should build")
    }

    /// Plays the part of a single worker for one task.
    async fn run_next(executor: &TaskExecutor) {
        let core = executor.core();
        let item = tokio::time::timeout(Duration::from_secs(2), core.next_task())
            .await
            .expect("a task should be ready")
            .expect("pipeline is running");
        core.execute(item, "test-worker").await;
    }

    type RunLog = Arc<Mutex<Vec<&'static str>>>;

    async fn submit_named(
        executor: &TaskExecutor,
        log: &RunLog,
        name: &'static str,
        priority: Priority,
    ) {
        let log = Arc::clone(log);
        executor
            .submit(
                move |_ctx: TaskContext| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().expect("log lock").push(name);
                        Ok::<_, WorkFailure>(())
                    }
                },
                priority,
                None,
            )
            .await
            .expect("pipeline accepts work");
    }

    #[test]
    fn test_result_slot_is_single_assignment() {
        let slot: ResultSlot<u32> = ResultSlot::new(TaskId::new());
        assert!(slot.mark_running());

        let state = slot
            .complete(TaskOutcome::Cancelled(CancelReason::Timeout))
            .expect("first write wins");
        assert_eq!(state, TaskState::Cancelled);

        let err = slot
            .complete(TaskOutcome::Succeeded(7))
            .expect_err("second write is refused");
        assert!(matches!(
            err,
            ProtocolViolation::SlotAlreadyTerminal {
                state: TaskState::Cancelled,
                ..
            }
        ));
        assert!(!slot.mark_running());
        assert!(matches!(
            slot.outcome(),
            Some(TaskOutcome::Cancelled(CancelReason::Timeout))
        ));
    }

    #[test]
    fn test_progress_final_exactly_once() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let tracker = ProgressTracker::new(
            TaskId::new(),
            Arc::new(move |_, update| sink.lock().expect("lock").push(update)),
        );

        tracker.advance(0);
        tracker.advance(150);
        assert!(tracker.finish(ProgressUpdate::Completed));
        assert!(!tracker.finish(ProgressUpdate::Aborted("late".to_string())));
        tracker.advance(50);

        let updates = updates.lock().expect("lock").clone();
        assert_eq!(
            updates,
            vec![
                ProgressUpdate::Percent(0),
                ProgressUpdate::Percent(99),
                ProgressUpdate::Completed,
            ]
        );
        assert_eq!(updates.iter().filter(|u| u.is_final()).count(), 1);
    }

    #[test]
    fn test_context_checkpoint_and_steps() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let id = TaskId::new();
        let ctx = TaskContext {
            task_id: id,
            attempt: 1,
            max_attempts: 3,
            cancel: Arc::new(CancelFlag::default()),
            progress: Some(Arc::new(ProgressTracker::new(
                id,
                Arc::new(move |_, update| sink.lock().expect("lock").push(update)),
            ))),
        };

        ctx.report_step(1, 4);
        ctx.report_step(4, 4);
        ctx.report_step(3, 0);
        assert!(ctx.checkpoint().is_ok());

        ctx.cancel.cancel();
        let failure = ctx.checkpoint().expect_err("cancelled");
        assert!(failure.is_interrupted());

        assert_eq!(
            updates.lock().expect("lock").clone(),
            vec![ProgressUpdate::Percent(25), ProgressUpdate::Percent(99)]
        );
    }

    #[tokio::test]
    async fn test_workers_take_buffered_work_in_priority_order() {
        let executor = executor(PipelineConfig::default());
        let log = RunLog::default();

        for (name, priority) in [
            ("low", Priority::Low),
            ("high", Priority::High),
            ("normal", Priority::Normal),
        ] {
            submit_named(&executor, &log, name, priority).await;
        }

        for _ in 0..3 {
            run_next(&executor).await;
        }
        assert_eq!(*log.lock().expect("lock"), vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_fifo_mode_ignores_priority() {
        let executor = executor(PipelineConfig::default().with_scheduling(SchedulingMode::Fifo));
        let log = RunLog::default();

        for (name, priority) in [("first", Priority::Low), ("second", Priority::High)] {
            submit_named(&executor, &log, name, priority).await;
        }

        run_next(&executor).await;
        run_next(&executor).await;
        assert_eq!(*log.lock().expect("lock"), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_retry_reoffers_until_success() {
        let executor = executor(PipelineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let handle = executor
            .submit(
                move |ctx: TaskContext| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if ctx.attempt() < 3 {
                            Err(WorkFailure::transient("not yet"))
                        } else {
                            Ok(ctx.attempt())
                        }
                    }
                },
                Priority::Normal,
                Some(RetryPolicy::new(3, Duration::from_millis(1))),
            )
            .await
            .expect("pipeline accepts work");

        for _ in 0..3 {
            run_next(&executor).await;
        }

        assert_eq!(handle.try_result().expect("finished").expect("succeeded"), 3);
        assert_eq!(handle.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.core().metrics().snapshot().retries, 2);
        assert_eq!(executor.core().gate().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_task_failed() {
        let executor = executor(PipelineConfig::default());
        let handle = executor
            .submit(
                |_ctx: TaskContext| async { Err::<(), _>(WorkFailure::permanent("bad input")) },
                Priority::Normal,
                Some(RetryPolicy::new(3, Duration::ZERO).transient_only()),
            )
            .await
            .expect("pipeline accepts work");

        run_next(&executor).await;

        let err = handle.wait().await.expect_err("work failed");
        assert!(matches!(err, PipelineError::TaskFailed { attempts: 1, .. }));
        assert_eq!(err.work_failure().map(|f| f.message()), Some("bad input"));
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_failure() {
        let executor = executor(PipelineConfig::default());
        let handle = executor
            .submit(
                |_ctx: TaskContext| async {
                    if true {
                        panic!("boom");
                    }
                    Ok::<(), WorkFailure>(())
                },
                Priority::High,
                Some(RetryPolicy::new(3, Duration::ZERO).transient_only()),
            )
            .await
            .expect("pipeline accepts work");

        run_next(&executor).await;

        let err = handle.wait().await.expect_err("work panicked");
        let failure = err.work_failure().expect("cause preserved");
        assert!(failure.message().contains("boom"));
        assert_eq!(executor.core().gate().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_releases_permit() {
        let executor = executor(PipelineConfig::default().with_permit_count(1));
        let handle = executor
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(1) },
                Priority::Normal,
                None,
            )
            .await
            .expect("pipeline accepts work");
        assert_eq!(executor.core().gate().outstanding(), 1);

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(executor.core().gate().outstanding(), 0);
        assert!(matches!(
            handle.wait().await,
            Err(PipelineError::Cancelled {
                reason: CancelReason::Requested,
                ..
            })
        ));

        // The freed permit admits the next task; the cancelled one is skipped.
        let next = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(2) },
                Priority::Low,
                None,
            )
            .expect("permit was released");
        run_next(&executor).await;
        assert_eq!(next.wait().await.expect("succeeded"), 2);
        assert_eq!(handle.attempts(), 0);
    }

    #[tokio::test]
    async fn test_try_submit_reports_exhausted_resources() {
        let executor = executor(PipelineConfig::default().with_permit_count(1));
        let _held = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect("first permit");
        let err = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect_err("no permit left");
        assert!(matches!(
            err,
            PipelineError::CapacityExceeded {
                resource: Resource::Permits
            }
        ));

        let executor = executor_with_buffer(1);
        let _held = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect("buffer slot free");
        let err = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect_err("buffer full");
        assert!(matches!(
            err,
            PipelineError::CapacityExceeded {
                resource: Resource::Buffer
            }
        ));
        // The rejected submission gave its permit back.
        assert_eq!(executor.core().gate().outstanding(), 1);
    }

    fn executor_with_buffer(capacity: usize) -> TaskExecutor {
        executor(
            PipelineConfig::default()
                .with_buffer_capacity(capacity)
                .with_permit_count(4),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_result_timeout_cancels_running_attempt() {
        let executor = executor(PipelineConfig::default());
        let handle = executor
            .submit(
                |ctx: TaskContext| async move {
                    ctx.cancelled().await;
                    ctx.checkpoint()?;
                    Ok::<_, WorkFailure>("unreachable")
                },
                Priority::Normal,
                None,
            )
            .await
            .expect("pipeline accepts work");

        let worker = {
            let executor = executor.clone();
            tokio::spawn(async move { run_next(&executor).await })
        };
        handle
            .subscribe()
            .wait_for(|state| *state == TaskState::Running)
            .await
            .expect("task state is observable");

        let err = handle
            .get_result(Some(Duration::from_millis(30)))
            .await
            .expect_err("work never finishes on its own");
        assert!(matches!(
            err,
            PipelineError::Timeout {
                operation: Operation::GetResult,
                ..
            }
        ));

        worker.await.expect("worker should not panic");
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(matches!(
            handle.try_result(),
            Some(Err(PipelineError::Cancelled {
                reason: CancelReason::Timeout,
                ..
            }))
        ));
        assert_eq!(handle.attempts(), 1);
        assert_eq!(executor.core().gate().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_submit_with_progress_reports_start_and_finish() {
        let executor = executor(PipelineConfig::default());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);

        let handle = executor
            .submit_with_progress(
                |ctx: TaskContext| async move {
                    ctx.report_step(1, 2);
                    Ok::<_, WorkFailure>(())
                },
                Priority::Normal,
                None,
                move |_, update| sink.lock().expect("lock").push(update),
            )
            .await
            .expect("pipeline accepts work");

        run_next(&executor).await;
        handle.wait().await.expect("succeeded");

        assert_eq!(
            updates.lock().expect("lock").clone(),
            vec![
                ProgressUpdate::Percent(0),
                ProgressUpdate::Percent(50),
                ProgressUpdate::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_task_gets_single_aborted_notice() {
        let executor = executor(PipelineConfig::default());
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);

        let handle = executor
            .submit_with_progress(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
                move |_, update| sink.lock().expect("lock").push(update),
            )
            .await
            .expect("pipeline accepts work");

        assert!(handle.cancel());
        assert_eq!(
            updates.lock().expect("lock").clone(),
            vec![ProgressUpdate::Aborted(CancelReason::Requested.to_string())]
        );
    }

    #[test]
    fn test_tracker_survives_panicking_callback() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let tracker = ProgressTracker::new(
            TaskId::new(),
            Arc::new(move |_: TaskId, update: ProgressUpdate| {
                if update == ProgressUpdate::Percent(0) {
                    panic!("sink unavailable");
                }
                sink.lock().expect("lock").push(update);
            }),
        );

        tracker.advance(0);
        tracker.advance(40);
        assert!(tracker.finish(ProgressUpdate::Completed));
        assert!(!tracker.finish(ProgressUpdate::Completed));

        assert_eq!(
            updates.lock().expect("lock").clone(),
            vec![ProgressUpdate::Percent(40), ProgressUpdate::Completed]
        );
    }

    #[tokio::test]
    async fn test_panicking_final_callback_still_returns_the_permit() {
        let executor = executor(PipelineConfig::default().with_permit_count(1));
        let handle = executor
            .submit_with_progress(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(5u32) },
                Priority::Normal,
                None,
                |_, update: ProgressUpdate| {
                    if update.is_final() {
                        panic!("sink unavailable");
                    }
                },
            )
            .await
            .expect("pipeline accepts work");

        run_next(&executor).await;

        assert_eq!(handle.try_result().expect("finished").expect("succeeded"), 5);
        assert_eq!(executor.core().gate().outstanding(), 0);
        executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect("the permit was returned");
    }

    #[tokio::test]
    async fn test_retry_waits_for_a_buffer_slot() {
        let executor = executor(PipelineConfig::default().with_buffer_capacity(1));
        let handle = executor
            .submit(
                |ctx: TaskContext| async move {
                    if ctx.attempt() < 2 {
                        Err(WorkFailure::transient("not yet"))
                    } else {
                        Ok(ctx.attempt())
                    }
                },
                Priority::Normal,
                Some(RetryPolicy::new(2, Duration::ZERO)),
            )
            .await
            .expect("pipeline accepts work");
        assert_eq!(executor.core().queued(), 1);

        run_next(&executor).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while executor.core().scheduled() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("retry should be re-offered");

        assert_eq!(executor.core().queued(), 1);
        let err = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect_err("the retry holds the only slot");
        assert!(matches!(
            err,
            PipelineError::CapacityExceeded {
                resource: Resource::Buffer
            }
        ));

        run_next(&executor).await;
        assert_eq!(handle.try_result().expect("finished").expect("succeeded"), 2);
        assert_eq!(executor.core().queued(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_submission_gets_aborted_notice() {
        let executor = executor(PipelineConfig::default().with_buffer_capacity(1));
        let _queued = executor
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .await
            .expect("slot free");

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            executor.submit_with_progress(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
                move |_, update| sink.lock().expect("lock").push(update),
            ),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(
            updates.lock().expect("lock").clone(),
            vec![ProgressUpdate::Aborted(CancelReason::Abandoned.to_string())]
        );
        assert_eq!(executor.core().gate().outstanding(), 1);
        assert_eq!(executor.core().queued(), 1);
    }

    #[tokio::test]
    async fn test_refusal_depends_on_lifecycle() {
        let executor = executor(PipelineConfig::default());
        let lease = executor.core().gate().try_acquire().expect("permit free");

        executor.core().begin_drain();
        let err = executor
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect_err("draining");
        assert!(matches!(
            err,
            PipelineError::Rejected {
                state: PipelineState::Draining
            }
        ));
        assert!(!err.is_fatal());

        drop(lease);
        assert!(executor.core().try_finish_drain());
        let err = executor
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .await
            .expect_err("stopped");
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            PipelineError::ProtocolViolation(ProtocolViolation::AfterStop {
                operation: "submit"
            })
        ));
    }
}
