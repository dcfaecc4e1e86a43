//! Retry policy and failure causes.
//!
//! A `RetryPolicy` is immutable and shared by `Arc` across every task that
//! uses it. Whether a failed attempt is retried depends on the attempt count
//! and on the policy's predicate over the `WorkFailure`.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum number of attempts per task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Broad class of a work failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The failure may go away on its own (I/O hiccup, busy resource).
    Transient,
    /// Retrying will not help.
    Permanent,
    /// The work stopped at a cancellation checkpoint.
    Interrupted,
}

/// Error reported by a unit of work.
#[derive(Clone)]
pub struct WorkFailure {
    kind: FailureKind,
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl WorkFailure {
    /// Creates a failure with an explicit kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// The work observed a cancellation request and stopped.
    pub fn interrupted() -> Self {
        Self::new(FailureKind::Interrupted, "interrupted at cancellation checkpoint")
    }

    /// Wraps an underlying error, keeping it as the source.
    pub fn from_error<E>(kind: FailureKind, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == FailureKind::Interrupted
    }
}

impl fmt::Debug for WorkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkFailure")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for WorkFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

type RetryPredicate = dyn Fn(&WorkFailure) -> bool + Send + Sync;

/// Governs re-attempts of failed work.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    predicate: Arc<RetryPredicate>,
}

impl RetryPolicy {
    /// Creates a policy that retries every failure except interruptions.
    ///
    /// `max_attempts` counts the first attempt; values below 1 are raised to 1.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            predicate: Arc::new(|failure: &WorkFailure| !failure.is_interrupted()),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Replaces the retry predicate.
    ///
    /// Interrupted failures are never retried regardless of the predicate.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&WorkFailure) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Restricts retries to failures of kind `Transient`.
    pub fn transient_only(self) -> Self {
        self.retry_if(WorkFailure::is_transient)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns whether the policy's predicate accepts this failure cause.
    pub fn is_retryable(&self, failure: &WorkFailure) -> bool {
        !failure.is_interrupted() && (self.predicate)(failure)
    }

    /// Returns whether another attempt should follow `attempts_made` attempts
    /// that ended in `failure`.
    pub fn should_retry(&self, failure: &WorkFailure, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts && self.is_retryable(failure)
    }

    /// Returns the number of attempts left after `attempts_made`.
    pub fn remaining_attempts(&self, attempts_made: u32) -> u32 {
        self.max_attempts.saturating_sub(attempts_made)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
