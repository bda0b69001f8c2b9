//! Retry policy for serialization conflicts.
//!
//! Under `SERIALIZABLE` isolation (PostgreSQL) or a contended writer lock
//! (libSQL) the store aborts one of two conflicting transactions. The
//! aborted unit of work is safe to run again because each attempt is a
//! single transaction with no partial effect, so [`ConflictRetryPolicy`]
//! re-runs it with jittered exponential backoff:
//!
//! `delay(attempt) = base_delay * 2^attempt * uniform(0.5, 1.5)`
//!
//! Errors that are not serialization conflicts propagate on the first
//! attempt. When every attempt conflicts the caller receives a
//! [`RetriesExhausted`] converted into its own error type, carrying a
//! retry-after hint for the client.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// SQLSTATE for `serialization_failure`.
pub const SERIALIZATION_FAILURE_CODE: &str = "40001";

/// Lowercased message fragments that identify a conflict when no typed
/// code is available.
const CONFLICT_MESSAGES: &[&str] = &[
    "could not serialize access",
    "database is locked",
    "sqlite_busy",
];

/// Decides whether a single error (one level of a cause chain) is a
/// retryable serialization conflict.
pub trait ConflictClassifier: Send + Sync {
    fn is_conflict(&self, err: &(dyn StdError + 'static)) -> bool;
}

/// Default classifier: PostgreSQL `40001` or a known conflict message.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializationFailure;

impl ConflictClassifier for SerializationFailure {
    fn is_conflict(&self, err: &(dyn StdError + 'static)) -> bool {
        #[cfg(feature = "postgres")]
        if let Some(pg) = err.downcast_ref::<tokio_postgres::Error>()
            && let Some(code) = pg.code()
        {
            return code.code() == SERIALIZATION_FAILURE_CODE;
        }

        let message = err.to_string().to_ascii_lowercase();
        CONFLICT_MESSAGES
            .iter()
            .any(|fragment| message.contains(fragment))
    }
}

/// Walk `err` and every `source()` below it, testing each level.
///
/// Instrumentation layers routinely wrap driver errors; the conflict code
/// lives on the innermost one.
pub fn is_conflict_chain(
    classifier: &dyn ConflictClassifier,
    err: &(dyn StdError + 'static),
) -> bool {
    let mut current = Some(err);
    while let Some(level) = current {
        if classifier.is_conflict(level) {
            return true;
        }
        current = level.source();
    }
    false
}

/// Raised once every attempt hit a serialization conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("serialization conflict retries exhausted after {attempts} attempts")]
pub struct RetriesExhausted {
    pub attempts: u32,
    pub retry_after: Duration,
}

/// Tunables for [`ConflictRetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Retries a transactional unit of work on serialization conflicts.
#[derive(Clone)]
pub struct ConflictRetryPolicy {
    config: RetryConfig,
    classifier: Arc<dyn ConflictClassifier>,
}

impl std::fmt::Debug for ConflictRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictRetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl ConflictRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(SerializationFailure),
        }
    }

    /// Replace the conflict classifier.
    pub fn with_classifier(mut self, classifier: impl ConflictClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether `err` (or anything in its cause chain) is a conflict.
    pub fn is_conflict(&self, err: &(dyn StdError + 'static)) -> bool {
        is_conflict_chain(self.classifier.as_ref(), err)
    }

    /// Run `operation` until it succeeds, fails with a non-conflict error,
    /// or the attempt budget is spent.
    #[tracing::instrument(
        skip(self, operation),
        fields(max_retries = self.config.max_retries)
    )]
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + From<RetriesExhausted> + 'static,
    {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "operation succeeded after serialization retry",
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.is_conflict(&err) {
                return Err(err);
            }

            attempt += 1;
            if attempt >= attempts {
                let exhausted = RetriesExhausted {
                    attempts,
                    retry_after: self.retry_after(),
                };
                tracing::warn!(
                    operation = operation_name,
                    attempts,
                    retry_after_ms = exhausted.retry_after.as_millis() as u64,
                    error = %err,
                    "serialization conflict retries exhausted",
                );
                return Err(exhausted.into());
            }

            let delay = self.backoff(attempt - 1);
            tracing::debug!(
                operation = operation_name,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "serialization conflict, retrying after backoff",
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Backoff before the attempt following `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let base = self.config.base_delay.saturating_mul(factor);
        if base.is_zero() {
            return Duration::ZERO;
        }
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(jitter)
    }

    /// Hint for clients once retries are exhausted: roughly the time the
    /// whole backoff schedule would have taken, never under one second.
    fn retry_after(&self) -> Duration {
        let factor = 1u32
            .checked_shl(self.config.max_retries)
            .unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(factor)
            .max(Duration::from_secs(1))
    }
}
