//! Retry-on-busy wrapper around a unit of database work.
//!
//! SQLite allows a single writer at a time. A deferred transaction that
//! tries to upgrade to a write lock while another connection holds it fails
//! with `SQLITE_BUSY` (or `SQLITE_BUSY_SNAPSHOT` when its snapshot went
//! stale) instead of waiting, so the whole unit of work has to be re-run.

use super::error::{ClassifyError, ErrorClass};
use std::{future::Future, time::Duration};
use tracing::{debug, error, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 10;
const BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Outcome of a retried unit of work that did not fail hard.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    value: Option<T>,
    retries: u32,
    failed_error: Option<E>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn successful(&self) -> bool {
        self.value.is_some()
    }

    /// Zero-based index of the last attempt: the number of re-executions,
    /// whether or not the work finally succeeded.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Last busy error seen when the ceiling was reached.
    pub fn failed_error(&self) -> Option<&E> {
        self.failed_error.as_ref()
    }

    pub fn value(self) -> Option<T> {
        self.value
    }

    pub fn into_parts(self) -> (Option<T>, u32, Option<E>) {
        (self.value, self.retries, self.failed_error)
    }
}

/// Re-runs a closure while it fails with a busy error.
///
/// Critical errors are logged and returned on the first occurrence. Errors
/// classified as [`ErrorClass::Other`] are returned as-is. When every
/// attempt came back busy the outcome carries no value and the last error.
#[derive(Clone, Copy, Debug)]
pub struct RetrySqlite {
    max_retries: u32,
    backoff_step: Duration,
}

impl Default for RetrySqlite {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetrySqlite {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff_step: BACKOFF_STEP,
        }
    }

    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn run<T, E, F, Fut>(&self, mut work: F) -> Result<RetryOutcome<T, E>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyError + std::fmt::Display,
    {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match work().await {
                Ok(value) => {
                    return Ok(RetryOutcome {
                        value: Some(value),
                        retries: attempt,
                        failed_error: None,
                    });
                }
                Err(err) => match err.classify() {
                    ErrorClass::Critical => {
                        error!("critical database error, not retrying: {}", err);
                        return Err(err);
                    }
                    ErrorClass::Other => return Err(err),
                    ErrorClass::Busy => {
                        debug!("database busy (attempt {}): {}", attempt + 1, err);
                        last_error = Some(err);
                        if attempt + 1 < self.max_retries {
                            tokio::time::sleep(self.backoff_step * (attempt + 1)).await;
                        }
                    }
                },
            }
        }
        let retries = self.max_retries - 1;
        if let Some(err) = &last_error {
            warn!("giving up after {} busy retries: {}", retries, err);
        }
        Ok(RetryOutcome {
            value: None,
            retries,
            failed_error: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fmt,
        sync::atomic::{AtomicU32, Ordering},
    };

    #[derive(Debug, PartialEq)]
    enum TestError {
        Busy,
        Corrupt,
        Constraint,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl ClassifyError for TestError {
        fn classify(&self) -> ErrorClass {
            match self {
                TestError::Busy => ErrorClass::Busy,
                TestError::Corrupt => ErrorClass::Critical,
                TestError::Constraint => ErrorClass::Other,
            }
        }
    }

    fn fast() -> RetrySqlite {
        RetrySqlite::default().with_backoff_step(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_first_time_without_retries() {
        let outcome = fast()
            .run(|| async { Ok::<_, TestError>(42) })
            .await
            .unwrap();
        assert!(outcome.successful());
        assert_eq!(outcome.retries(), 0);
        assert_eq!(outcome.value(), Some(42));
    }

    #[tokio::test]
    async fn recovers_after_three_busy_errors() {
        let calls = &AtomicU32::new(0);
        let outcome = fast()
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(TestError::Busy)
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert!(outcome.successful());
        assert_eq!(outcome.retries(), 3);
        assert!(outcome.failed_error().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn critical_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = fast()
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Corrupt)
            })
            .await
            .unwrap_err();
        assert_eq!(err, TestError::Corrupt);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_errors_are_returned_untouched() {
        let calls = &AtomicU32::new(0);
        let err = fast()
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Constraint)
            })
            .await
            .unwrap_err();
        assert_eq!(err, TestError::Constraint);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_and_attempt_index() {
        let calls = &AtomicU32::new(0);
        let outcome = fast()
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Busy)
            })
            .await
            .unwrap();
        assert!(!outcome.successful());
        assert_eq!(outcome.retries(), DEFAULT_MAX_RETRIES - 1);
        assert_eq!(outcome.failed_error(), Some(&TestError::Busy));
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_RETRIES);
    }
}
