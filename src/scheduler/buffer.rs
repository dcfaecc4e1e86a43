//! Fixed-capacity circular buffer for work awaiting a worker.
//!
//! `put` suspends while the buffer is full and `take` suspends while it is
//! empty. Each successful operation wakes at most one waiter on the other
//! side. Both futures are cancel-safe: an item is only moved while the ring
//! lock is held, in the same poll that completes the future, so dropping a
//! suspended caller never leaks a slot or leaves a phantom item.
//!
//! A consumer that forwards items to a second queue can take them *held*:
//! the item leaves the ring but its slot stays occupied until
//! `release_held`, so the capacity bounds everything not yet started.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Operation, PipelineError, Resource};

/// Ring storage with explicit occupancy so equal cursors are unambiguous.
struct Ring<T> {
    slots: Vec<Option<T>>,
    read: usize,
    write: usize,
    len: usize,
    held: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            read: 0,
            write: 0,
            len: 0,
            held: 0,
            closed: false,
        }
    }

    fn is_full(&self) -> bool {
        self.len + self.held >= self.slots.len()
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.slots[self.write] = Some(item);
        self.write = (self.write + 1) % self.slots.len();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.read].take();
        self.read = (self.read + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

/// Outcome of a non-blocking `try_put`.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPutError<T> {
    /// Every slot is occupied; the item is handed back.
    Full(T),
    /// The buffer was closed; the item is handed back.
    Closed(T),
}

impl<T> TryPutError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            TryPutError::Full(item) | TryPutError::Closed(item) => item,
        }
    }
}

impl<T> From<&TryPutError<T>> for PipelineError {
    fn from(err: &TryPutError<T>) -> Self {
        match err {
            TryPutError::Full(_) => PipelineError::CapacityExceeded {
                resource: Resource::Buffer,
            },
            TryPutError::Closed(_) => PipelineError::Closed {
                resource: Resource::Buffer,
            },
        }
    }
}

/// Bounded multi-producer multi-consumer buffer.
pub struct BoundedBuffer<T> {
    ring: Mutex<Ring<T>>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> BoundedBuffer<T> {
    /// Creates a buffer holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            capacity,
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Slots in use: buffered items plus items taken held.
    pub fn occupied(&self) -> usize {
        let ring = self.lock();
        ring.len + ring.held
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Inserts an item, suspending while the buffer is full.
    ///
    /// Returns the item back if the buffer is (or becomes) closed.
    pub async fn put(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(TryPutError::Closed(rejected)) => return Err(rejected),
                Err(TryPutError::Full(rejected)) => item = rejected,
            }

            space.await;
        }
    }

    /// Like `put`, but gives up after `timeout`.
    pub async fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), PipelineError> {
        match tokio::time::timeout(timeout, self.put(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PipelineError::Closed {
                resource: Resource::Buffer,
            }),
            Err(_) => Err(PipelineError::Timeout {
                operation: Operation::Enqueue,
                after: timeout,
            }),
        }
    }

    /// Inserts an item without waiting.
    pub fn try_put(&self, item: T) -> Result<(), TryPutError<T>> {
        {
            let mut ring = self.lock();
            if ring.closed {
                return Err(TryPutError::Closed(item));
            }
            if ring.is_full() {
                return Err(TryPutError::Full(item));
            }
            ring.push(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item, suspending while the buffer is empty.
    ///
    /// Returns `None` once the buffer is closed and fully drained.
    pub async fn take(&self) -> Option<T> {
        self.take_inner(false).await
    }

    /// Like `take`, but the slot stays occupied until `release_held`.
    pub async fn take_held(&self) -> Option<T> {
        self.take_inner(true).await
    }

    async fn take_inner(&self, hold: bool) -> Option<T> {
        loop {
            let data = self.not_empty.notified();
            tokio::pin!(data);
            data.as_mut().enable();

            {
                let mut ring = self.lock();
                if let Some(item) = ring.pop() {
                    if hold {
                        ring.held += 1;
                    } else {
                        drop(ring);
                        self.not_full.notify_one();
                    }
                    return Some(item);
                }
                if ring.closed {
                    return None;
                }
            }

            data.await;
        }
    }

    /// Removes the oldest item without waiting.
    pub fn try_take(&self) -> Option<T> {
        let item = self.lock().pop();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Like `try_take`, but the slot stays occupied until `release_held`.
    pub fn try_take_held(&self) -> Option<T> {
        let mut ring = self.lock();
        let item = ring.pop();
        if item.is_some() {
            ring.held += 1;
        }
        item
    }

    /// Occupies a free slot without an item, suspending while full.
    ///
    /// Returns false if the buffer is (or becomes) closed. Cancel-safe: the
    /// slot is only taken in the poll that returns true.
    pub async fn reserve(&self) -> bool {
        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut ring = self.lock();
                if ring.closed {
                    return false;
                }
                if !ring.is_full() {
                    ring.held += 1;
                    return true;
                }
            }

            space.await;
        }
    }

    /// Frees a slot taken by `take_held`, `try_take_held` or `reserve`.
    pub fn release_held(&self) {
        {
            let mut ring = self.lock();
            if ring.held == 0 {
                return;
            }
            ring.held -= 1;
        }
        self.not_full.notify_one();
    }

    /// Closes the buffer: further puts fail and blocked callers wake up.
    ///
    /// Items already buffered stay available to `take` and `drain`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    /// Removes and returns every buffered item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut ring = self.lock();
            std::iter::from_fn(|| ring.pop()).collect()
        };
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }
}

impl<T> std::fmt::Debug for BoundedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.lock();
        f.debug_struct("BoundedBuffer")
            .field("capacity", &self.capacity)
            .field("len", &ring.len)
            .field("held", &ring.held)
            .field("closed", &ring.closed)
            .finish()
    }
}
