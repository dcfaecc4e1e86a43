//! Worker pool draining the scheduler.
//!
//! Each worker is an independent tokio task that asks the executor for the
//! next task, runs one attempt, and repeats until the pipeline stops.
//!
//! # Features
//!
//! - Fixed number of workers, started once
//! - Workers stop on their own when the pipeline reaches `Stopped`
//! - Pool statistics derived from the pipeline metrics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{PipelineError, ProtocolViolation};

use super::executor::ExecutorCore;

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of workers the pool was configured with.
    pub num_workers: usize,
    /// Workers whose loop has not exited yet.
    pub running_workers: usize,
    /// Workers currently running an attempt.
    pub active_workers: usize,
    /// Tasks accepted for execution.
    pub tasks_submitted: u64,
    /// Tasks that succeeded.
    pub tasks_succeeded: u64,
    /// Tasks that failed after their last attempt.
    pub tasks_failed: u64,
    /// Tasks that were cancelled, timed out or discarded.
    pub tasks_cancelled: u64,
    /// Attempts re-offered after a failure.
    pub retries: u64,
    /// Average duration of a single attempt.
    pub average_attempt_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks that reached a terminal state.
    pub fn total_processed(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed + self.tasks_cancelled
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_succeeded as f64 / total as f64) * 100.0
    }
}

/// Pool of workers attached to one executor.
pub struct WorkerPool {
    core: Arc<ExecutorCore>,
    num_workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<watch::Sender<usize>>,
    started: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn new(core: Arc<ExecutorCore>, num_workers: usize) -> Self {
        let (running, _) = watch::channel(0);
        Self {
            core,
            num_workers,
            handles: Mutex::new(Vec::new()),
            running: Arc::new(running),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the workers. Must be called within a tokio runtime.
    ///
    /// Starting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the pipeline has already stopped.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.core.state().is_stopped() {
            return Err(ProtocolViolation::AfterStop { operation: "start" }.into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already started");
            return Ok(());
        }

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for i in 0..self.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                core: Arc::clone(&self.core),
                running: Arc::clone(&self.running),
            };
            self.running.send_modify(|n| *n += 1);
            handles.push(tokio::spawn(worker.run()));
        }

        info!(num_workers = self.num_workers, "Worker pool started");
        Ok(())
    }

    /// Waits until every worker loop has exited.
    ///
    /// Workers exit once the pipeline stops, so this only returns after a
    /// drain has completed or a forceful shutdown.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }

        let mut running = self.running.subscribe();
        let _ = running.wait_for(|n| *n == 0).await;
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let snapshot = self.core.metrics().snapshot();
        PoolStats {
            num_workers: self.num_workers,
            running_workers: self.running_workers(),
            active_workers: snapshot.active_workers as usize,
            tasks_submitted: snapshot.submitted,
            tasks_succeeded: snapshot.succeeded,
            tasks_failed: snapshot.failed,
            tasks_cancelled: snapshot.cancelled,
            retries: snapshot.retries,
            average_attempt_duration: snapshot.average_attempt_duration(),
        }
    }

    /// Returns whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Returns the number of worker loops still running.
    pub fn running_workers(&self) -> usize {
        *self.running.borrow()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers)
            .field("running_workers", &self.running_workers())
            .field("started", &self.is_started())
            .finish()
    }
}

/// Decrements the running count however the worker loop ends.
struct ExitGuard(Arc<watch::Sender<usize>>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// A single worker pulling tasks from the executor.
pub struct Worker {
    id: String,
    core: Arc<ExecutorCore>,
    running: Arc<watch::Sender<usize>>,
}

impl Worker {
    /// Main worker loop. Runs until the pipeline stops.
    async fn run(self) {
        let _exit = ExitGuard(Arc::clone(&self.running));
        info!(worker_id = %self.id, "Worker started");

        while let Some(item) = self.core.next_task().await {
            let metrics = self.core.metrics();
            metrics.worker_busy();
            self.core.execute(item, &self.id).await;
            metrics.worker_idle();
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}
