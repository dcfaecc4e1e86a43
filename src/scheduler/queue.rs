//! Priority scheduler for pending work.
//!
//! Entries are ordered by an explicit total-order key computed once at offer
//! time: `(priority rank, arrival sequence, insertion sequence)`. The key is
//! stored in a `BTreeMap`, so `offer` and `poll_next` are O(log n) and equal
//! priorities are always served in arrival order.
//!
//! A secondary index by `TaskId` lets a cancelled task be removed directly
//! without waiting for a worker to dequeue it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use super::job::{Priority, TaskId};

/// An entry the scheduler can order.
pub trait Schedulable {
    fn task_id(&self) -> TaskId;
    fn priority(&self) -> Priority;
    /// Monotonic arrival sequence; lower values arrived earlier.
    fn arrival(&self) -> u64;
}

/// Total-order key: priority rank, then arrival, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScheduleKey {
    rank: u8,
    arrival: u64,
    seq: u64,
}

impl ScheduleKey {
    pub fn priority_rank(&self) -> u8 {
        self.rank
    }

    pub fn arrival(&self) -> u64 {
        self.arrival
    }
}

/// Why an offer was refused. The entry is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferError<T> {
    /// The scheduler was closed.
    Closed(T),
    /// An entry for the same task is already pending.
    Duplicate(T),
}

impl<T> OfferError<T> {
    pub fn into_inner(self) -> T {
        match self {
            OfferError::Closed(item) | OfferError::Duplicate(item) => item,
        }
    }
}

struct Inner<T> {
    entries: BTreeMap<ScheduleKey, T>,
    index: HashMap<TaskId, ScheduleKey>,
    next_seq: u64,
    closed: bool,
}

impl<T: Schedulable> Inner<T> {
    fn pop_first(&mut self) -> Option<T> {
        let (_, item) = self.entries.pop_first()?;
        self.index.remove(&item.task_id());
        Some(item)
    }
}

/// Concurrent priority queue shared by all workers.
pub struct PriorityScheduler<T> {
    inner: Mutex<Inner<T>>,
    offered: Notify,
}

impl<T: Schedulable> PriorityScheduler<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                index: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            offered: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an entry and wakes one waiting consumer.
    pub fn offer(&self, item: T) -> Result<ScheduleKey, OfferError<T>> {
        let key = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(OfferError::Closed(item));
            }
            let task_id = item.task_id();
            if inner.index.contains_key(&task_id) {
                return Err(OfferError::Duplicate(item));
            }
            let key = ScheduleKey {
                rank: item.priority().rank(),
                arrival: item.arrival(),
                seq: inner.next_seq,
            };
            inner.next_seq += 1;
            inner.index.insert(task_id, key);
            inner.entries.insert(key, item);
            key
        };
        self.offered.notify_one();
        Ok(key)
    }

    /// Removes and returns the highest-priority, earliest-arrived entry.
    pub fn poll_next(&self) -> Option<T> {
        self.lock().pop_first()
    }

    /// Waits for the next entry.
    ///
    /// Returns `None` once the scheduler is closed and empty. Cancel-safe:
    /// an entry is only removed in the poll that returns it.
    pub async fn next(&self) -> Option<T> {
        loop {
            let offered = self.notified();
            tokio::pin!(offered);
            offered.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(item) = inner.pop_first() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            offered.await;
        }
    }

    /// Removes a pending entry by task id.
    pub fn remove(&self, task_id: TaskId) -> Option<T> {
        let mut inner = self.lock();
        let key = inner.index.remove(&task_id)?;
        inner.entries.remove(&key)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.lock().index.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Future resolving on the next `offer` or `close`.
    ///
    /// Callers combining this with other wake-ups should `enable` it before
    /// checking the queue so an offer in between is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.offered.notified()
    }

    /// Refuses further offers and wakes every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.offered.notify_waiters();
    }

    /// Removes every pending entry, in the order they would have been served.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.index.clear();
        std::mem::take(&mut inner.entries).into_values().collect()
    }
}

impl<T: Schedulable> Default for PriorityScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PriorityScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PriorityScheduler")
            .field("pending", &inner.entries.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
