//! Counting permit pool bounding how much work is in flight.
//!
//! The gate is built on a fair `tokio::sync::Semaphore`. Each acquisition
//! yields a `PermitLease` that is owned by exactly one holder. Dropping a
//! lease releases it, so every exit path (including a cancelled future or a
//! panicking task) gives the permit back. `release` is the explicit path and
//! checks the lease against the gate's ledger of outstanding leases.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error};

use crate::error::{Operation, PipelineError, ProtocolViolation, Resource};

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a lease, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId {
    gate: u64,
    seq: u64,
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gate, self.seq)
    }
}

/// Outstanding leases, shared between the gate and its leases.
struct Ledger {
    outstanding: Mutex<HashSet<LeaseId>>,
    count: watch::Sender<usize>,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, HashSet<LeaseId>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: LeaseId) {
        let mut outstanding = self.lock();
        outstanding.insert(id);
        self.count.send_replace(outstanding.len());
    }

    fn remove(&self, id: LeaseId) {
        let mut outstanding = self.lock();
        outstanding.remove(&id);
        self.count.send_replace(outstanding.len());
    }
}

/// One unit of admitted capacity.
///
/// Released exactly once: explicitly through `AdmissionGate::release`, or
/// implicitly when dropped.
pub struct PermitLease {
    id: LeaseId,
    acquired_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    ledger: Arc<Ledger>,
}

impl PermitLease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// How long the lease has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    fn settle(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.ledger.remove(self.id);
            drop(permit);
        }
    }
}

impl Drop for PermitLease {
    fn drop(&mut self) {
        if self.permit.is_some() {
            debug!(lease = %self.id, "Lease released on drop");
            self.settle();
        }
    }
}

impl fmt::Debug for PermitLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitLease")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .finish()
    }
}

/// Counting permit pool.
pub struct AdmissionGate {
    id: u64,
    limit: usize,
    semaphore: Arc<Semaphore>,
    ledger: Arc<Ledger>,
    next_seq: AtomicU64,
}

impl AdmissionGate {
    /// Creates a gate with `limit` permits (at least one).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        let (count, _) = watch::channel(0);
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            ledger: Arc::new(Ledger {
                outstanding: Mutex::new(HashSet::new()),
                count,
            }),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Configured number of permits.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of leases currently held.
    pub fn outstanding(&self) -> usize {
        *self.ledger.count.borrow()
    }

    /// Number of permits that could be acquired right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Watches the number of outstanding leases.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.ledger.count.subscribe()
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> PermitLease {
        let id = LeaseId {
            gate: self.id,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.ledger.insert(id);
        PermitLease {
            id,
            acquired_at: Instant::now(),
            permit: Some(permit),
            ledger: Arc::clone(&self.ledger),
        }
    }

    /// Waits until a permit is available.
    ///
    /// Dropping the returned future before it completes acquires nothing.
    pub async fn acquire(&self) -> Result<PermitLease, PipelineError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Closed {
                resource: Resource::Permits,
            })?;
        Ok(self.issue(permit))
    }

    /// Waits at most `timeout` for a permit.
    pub async fn try_acquire_for(&self, timeout: Duration) -> Result<PermitLease, PipelineError> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                operation: Operation::AcquirePermit,
                after: timeout,
            }),
        }
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> Result<PermitLease, PipelineError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.issue(permit)),
            Err(TryAcquireError::NoPermits) => Err(PipelineError::CapacityExceeded {
                resource: Resource::Permits,
            }),
            Err(TryAcquireError::Closed) => Err(PipelineError::Closed {
                resource: Resource::Permits,
            }),
        }
    }

    /// Returns a lease to the gate.
    ///
    /// A lease issued by another gate is a protocol violation; its permit
    /// still goes back to its own gate. Releasing twice cannot happen, the
    /// lease moves into the first call:
    ///
    /// ```compile_fail
    /// use workline::scheduler::AdmissionGate;
    ///
    /// let gate = AdmissionGate::new(1);
    /// let lease = gate.try_acquire().unwrap();
    /// gate.release(lease).unwrap();
    /// gate.release(lease).unwrap();
    /// ```
    pub fn release(&self, mut lease: PermitLease) -> Result<(), PipelineError> {
        let id = lease.id;
        if id.gate != self.id {
            error!(lease = %id, gate = self.id, "Lease released to the wrong gate");
            return Err(ProtocolViolation::ForeignLease { lease: id }.into());
        }
        lease.settle();
        debug!(lease = %id, "Lease released");
        Ok(())
    }

    /// Stops issuing permits; pending and future acquisitions fail.
    ///
    /// Outstanding leases remain valid and can still be released.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("id", &self.id)
            .field("limit", &self.limit)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}
