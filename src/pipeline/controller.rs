//! Pipeline controller owning the lifecycle of one pipeline instance.
//!
//! The controller wires an executor to a worker pool and exposes:
//! - Task submission (blocking, non-blocking, with progress)
//! - Direct permit leases for host-managed work
//! - Graceful, forceful and bounded shutdown
//! - Statistics and Prometheus export

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Operation, PipelineError};
use crate::scheduler::executor::{ProgressUpdate, TaskExecutor, TaskHandle, Work};
use crate::scheduler::gate::PermitLease;
use crate::scheduler::job::{DiscardedItem, Priority, TaskId};
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::worker_pool::{PoolStats, WorkerPool};

use super::config::PipelineConfig;
use super::state::PipelineState;

/// A running pipeline.
///
/// Dropping a controller that has not stopped shuts it down forcefully.
pub struct PipelineController {
    config: PipelineConfig,
    executor: TaskExecutor,
    pool: WorkerPool,
}

impl PipelineController {
    /// Validates `config`, builds the pipeline and starts its workers.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn start(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let executor = TaskExecutor::new(&config)?;
        let pool = WorkerPool::new(std::sync::Arc::clone(executor.core()), config.worker_count);
        pool.start()?;

        info!(
            workers = config.worker_count,
            permits = config.permit_count,
            buffer_capacity = config.buffer_capacity,
            scheduling = %config.scheduling,
            "Pipeline started"
        );

        Ok(Self {
            config,
            executor,
            pool,
        })
    }

    /// Returns the configuration the pipeline was started with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.executor.core().state()
    }

    /// Watches the lifecycle state.
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.executor.core().subscribe_state()
    }

    /// Returns the submission front-end, for sharing with producers.
    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Submits work, waiting for a permit and a buffer slot.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` while the pipeline drains and a protocol violation
    /// once it has stopped.
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
        self.executor.submit(work, priority, policy).await
    }

    /// Submits work without waiting.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` when no permit or buffer slot is free.
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
        self.executor.try_submit(work, priority, policy)
    }

    /// Submits work and reports its progress to `callback`.
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
        self.executor
            .submit_with_progress(work, priority, policy, callback)
            .await
    }

    /// Cancels a task. Returns false if it had already finished.
    pub fn cancel<T: Send + 'static>(&self, handle: &TaskHandle<T>) -> bool {
        handle.cancel()
    }

    /// Waits for a task's outcome, cancelling it if `timeout` expires.
    pub async fn get_result<T: Clone + Send + 'static>(
        &self,
        handle: &TaskHandle<T>,
        timeout: Option<Duration>,
    ) -> Result<T, PipelineError> {
        handle.get_result(timeout).await
    }

    /// Leases a permit for work the host runs itself.
    ///
    /// Held leases count as outstanding work: a graceful drain does not
    /// complete until they are released or dropped.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if `timeout` expires, `Rejected` while draining and
    /// a protocol violation once the pipeline has stopped.
    pub async fn acquire_permit(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PermitLease, PipelineError> {
        let core = self.executor.core();
        if !core.state().accepts_work() {
            return Err(core.refusal("acquire_permit"));
        }
        let acquired = match timeout {
            Some(timeout) => core.gate().try_acquire_for(timeout).await,
            None => core.gate().acquire().await,
        };
        acquired.map_err(|e| self.lifecycle_error(e))
    }

    /// Leases a permit only if one is free right now.
    pub fn try_acquire_permit(&self) -> Result<PermitLease, PipelineError> {
        let core = self.executor.core();
        if !core.state().accepts_work() {
            return Err(core.refusal("try_acquire_permit"));
        }
        core.gate().try_acquire().map_err(|e| self.lifecycle_error(e))
    }

    /// Returns a permit leased with `acquire_permit`.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation for a lease from another pipeline.
    pub fn release_permit(&self, lease: PermitLease) -> Result<(), PipelineError> {
        let core = self.executor.core();
        core.gate().release(lease)?;
        core.try_finish_drain();
        Ok(())
    }

    fn lifecycle_error(&self, error: PipelineError) -> PipelineError {
        match error {
            PipelineError::Closed { .. } => self.executor.core().rejection(),
            other => other,
        }
    }

    /// Starts a graceful shutdown.
    ///
    /// New submissions are rejected; queued and running tasks, retries
    /// included, run to completion. Idempotent.
    pub fn shutdown(&self) {
        if self.executor.core().begin_drain() {
            info!("Pipeline draining");
        } else {
            debug!(state = %self.state(), "Shutdown requested again");
        }
    }

    /// Stops immediately.
    ///
    /// Running attempts are signalled to cancel and queued tasks are
    /// cancelled. Returns the queued tasks that were discarded, or nothing if
    /// the pipeline had already stopped.
    pub fn shutdown_now(&self) -> Vec<DiscardedItem> {
        self.executor.core().shutdown_now()
    }

    /// Drains for up to the configured shutdown timeout, then stops forcefully.
    pub async fn shutdown_timeout(&self) -> Vec<DiscardedItem> {
        self.shutdown();
        if self.await_termination(self.config.shutdown_timeout).await {
            return Vec::new();
        }

        warn!(
            timeout = ?self.config.shutdown_timeout,
            error = %PipelineError::Timeout {
                operation: Operation::Shutdown,
                after: self.config.shutdown_timeout,
            },
            "Drain did not finish in time, stopping now"
        );
        self.shutdown_now()
    }

    /// Waits until the pipeline is stopped and every worker has exited.
    ///
    /// Returns false if `timeout` expired first.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut state = self.executor.core().subscribe_state();
        let terminated = async {
            let _ = state.wait_for(|s| s.is_stopped()).await;
            self.pool.join().await;
        };
        tokio::time::timeout(timeout, terminated).await.is_ok()
    }

    /// Returns current pool statistics.
    ///
    /// Outcome counters are updated by the worker right after the result
    /// becomes visible on the handle; they are final once
    /// `await_termination` has returned true.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Exports metrics in Prometheus text format.
    pub fn export_metrics(&self) -> String {
        let core = self.executor.core();
        let metrics = core.metrics();
        metrics.observe_occupancy(core.buffered(), core.scheduled(), core.gate().outstanding());
        metrics.export()
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if !self.state().is_stopped() {
            debug!("Pipeline controller dropped while running, stopping");
            self.shutdown_now();
        }
    }
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("state", &self.state())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProtocolViolation, Resource};
    use crate::scheduler::executor::TaskContext;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use crate::scheduler::retry::WorkFailure;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_worker_count(2)
            .with_permit_count(4)
            .with_buffer_capacity(8)
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let err = PipelineController::start(PipelineConfig::default().with_worker_count(0))
            .expect_err("zero workers is invalid");
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn test_submit_and_get_result() {
        let controller = PipelineController::start(config()).expect("pipeline starts");
        assert_eq!(controller.state(), PipelineState::Running);

        let handle = controller
            .submit(
                |ctx: TaskContext| async move { Ok::<_, WorkFailure>(ctx.attempt() + 41) },
                Priority::High,
                None,
            )
            .await
            .expect("pipeline accepts work");

        let value = controller
            .get_result(&handle, Some(Duration::from_secs(2)))
            .await
            .expect("task succeeds");
        assert_eq!(value, 42);
        assert!(!controller.cancel(&handle));
    }

    #[tokio::test]
    async fn test_refusals_while_draining_and_after_stop() {
        let controller = PipelineController::start(config()).expect("pipeline starts");
        let lease = controller
            .acquire_permit(Some(Duration::from_millis(100)))
            .await
            .expect("permit available");
        controller.shutdown();
        controller.shutdown();
        assert_eq!(controller.state(), PipelineState::Draining);

        let err = controller
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .await
            .expect_err("draining pipeline rejects work");
        assert!(err.is_rejection());
        assert!(!err.is_fatal());
        let err = controller.try_acquire_permit().expect_err("draining");
        assert!(matches!(
            err,
            PipelineError::Rejected {
                state: PipelineState::Draining
            }
        ));

        controller.release_permit(lease).expect("own lease");
        assert!(controller.await_termination(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), PipelineState::Stopped);

        let after_stop = |err: PipelineError| match err {
            PipelineError::ProtocolViolation(ProtocolViolation::AfterStop { operation }) => {
                operation
            }
            other => panic!("expected an after-stop violation, got {other}"),
        };
        let err = controller
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .await
            .expect_err("stopped");
        assert!(err.is_fatal());
        assert_eq!(after_stop(err), "submit");
        let err = controller
            .try_submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Normal,
                None,
            )
            .expect_err("stopped");
        assert_eq!(after_stop(err), "try_submit");
        let err = controller.acquire_permit(None).await.expect_err("stopped");
        assert_eq!(after_stop(err), "acquire_permit");
        let err = controller.try_acquire_permit().expect_err("stopped");
        assert_eq!(after_stop(err), "try_acquire_permit");

        assert!(controller.shutdown_now().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_progress_callback_keeps_worker_running() {
        let controller = PipelineController::start(config().with_worker_count(1))
            .expect("pipeline starts");

        let first = controller
            .submit_with_progress(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(1u32) },
                Priority::Normal,
                None,
                |_, update: ProgressUpdate| {
                    if update.is_final() {
                        panic!("progress sink failed");
                    }
                },
            )
            .await
            .expect("pipeline accepts work");
        assert_eq!(
            first
                .get_result(Some(Duration::from_secs(2)))
                .await
                .expect("task succeeds"),
            1
        );

        let second = controller
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(2u32) },
                Priority::Normal,
                None,
            )
            .await
            .expect("pipeline accepts work");
        assert_eq!(
            second
                .get_result(Some(Duration::from_secs(2)))
                .await
                .expect("the worker is still running"),
            2
        );
        assert_eq!(controller.stats().running_workers, 1);

        controller.shutdown();
        assert!(controller.await_termination(Duration::from_secs(2)).await);
        assert_eq!(controller.executor().core().gate().outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_work_stays_within_buffer_capacity() {
        const CAPACITY: usize = 2;
        const PRODUCERS: usize = 3;
        const PER_PRODUCER: usize = 20;

        let controller = Arc::new(
            PipelineController::start(
                config()
                    .with_worker_count(1)
                    .with_permit_count(64)
                    .with_buffer_capacity(CAPACITY),
            )
            .expect("pipeline starts"),
        );

        let done = Arc::new(AtomicBool::new(false));
        let peak_queued = Arc::new(AtomicUsize::new(0));
        let peak_scheduled = Arc::new(AtomicUsize::new(0));
        let sampler = {
            let controller = Arc::clone(&controller);
            let done = Arc::clone(&done);
            let peak_queued = Arc::clone(&peak_queued);
            let peak_scheduled = Arc::clone(&peak_scheduled);
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    let core = controller.executor().core();
                    peak_queued.fetch_max(core.queued(), Ordering::SeqCst);
                    peak_scheduled.fetch_max(core.scheduled(), Ordering::SeqCst);
                    peak_queued.fetch_max(core.buffered(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let mut producers = Vec::new();
        for _ in 0..PRODUCERS {
            let controller = Arc::clone(&controller);
            producers.push(tokio::spawn(async move {
                let mut handles = Vec::new();
                for _ in 0..PER_PRODUCER {
                    let handle = controller
                        .submit(
                            |_ctx: TaskContext| async {
                                tokio::time::sleep(Duration::from_millis(10)).await;
                                Ok::<_, WorkFailure>(())
                            },
                            Priority::Normal,
                            None,
                        )
                        .await
                        .expect("pipeline accepts work");
                    handles.push(handle);
                }
                for handle in handles {
                    handle.wait().await.expect("task succeeds");
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer should not panic");
        }

        done.store(true, Ordering::SeqCst);
        sampler.await.expect("sampler should not panic");

        assert!(peak_queued.load(Ordering::SeqCst) <= CAPACITY);
        assert!(peak_scheduled.load(Ordering::SeqCst) <= CAPACITY);

        controller.shutdown();
        assert!(controller.await_termination(Duration::from_secs(2)).await);
        assert_eq!(
            controller.stats().tasks_succeeded,
            (PRODUCERS * PER_PRODUCER) as u64
        );
    }

    #[tokio::test]
    async fn test_host_lease_holds_drain_open() {
        let controller = PipelineController::start(config()).expect("pipeline starts");
        let lease = controller
            .acquire_permit(Some(Duration::from_millis(100)))
            .await
            .expect("permit available");

        controller.shutdown();
        assert!(!controller.await_termination(Duration::from_millis(50)).await);
        assert_eq!(controller.state(), PipelineState::Draining);

        controller.release_permit(lease).expect("own lease");
        assert!(controller.await_termination(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_try_acquire_permit_exhaustion() {
        let controller = PipelineController::start(config().with_permit_count(1))
            .expect("pipeline starts");
        let _lease = controller.try_acquire_permit().expect("one permit");

        let err = controller.try_acquire_permit().expect_err("exhausted");
        assert!(matches!(
            err,
            PipelineError::CapacityExceeded {
                resource: Resource::Permits
            }
        ));

        let err = controller
            .acquire_permit(Some(Duration::from_millis(20)))
            .await
            .expect_err("still exhausted");
        assert!(matches!(
            err,
            PipelineError::Timeout {
                operation: Operation::AcquirePermit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_timeout_escalates() {
        let controller = PipelineController::start(
            config().with_shutdown_timeout(Duration::from_millis(50)),
        )
        .expect("pipeline starts");

        let handle = controller
            .submit(
                |ctx: TaskContext| async move {
                    ctx.cancelled().await;
                    Err::<(), _>(WorkFailure::interrupted())
                },
                Priority::Normal,
                None,
            )
            .await
            .expect("pipeline accepts work");

        let discarded = controller.shutdown_timeout().await;
        assert!(discarded.is_empty());
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert!(matches!(
            handle.wait().await,
            Err(PipelineError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_export_metrics_reports_counts() {
        let controller = PipelineController::start(config()).expect("pipeline starts");
        let handle = controller
            .submit(
                |_ctx: TaskContext| async { Ok::<_, WorkFailure>(()) },
                Priority::Low,
                None,
            )
            .await
            .expect("pipeline accepts work");
        handle.wait().await.expect("task succeeds");
        controller.shutdown();
        assert!(controller.await_termination(Duration::from_secs(2)).await);

        let text = controller.export_metrics();
        assert!(text.contains("workline_tasks_submitted_total 1"));
        assert!(text.contains("workline_tasks_total{outcome=\"succeeded\"} 1"));

        let stats = controller.stats();
        assert_eq!(stats.tasks_succeeded, 1);
        assert_eq!(stats.num_workers, 2);
    }
}
