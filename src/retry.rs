use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::SchedulerError;

/// Fixed-delay retry policy applied to every handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` until it succeeds or `max_retries + 1` attempts have
    /// failed. The attempt number (starting at 0) is passed to `operation`.
    ///
    /// Cancellation aborts the loop immediately, including while waiting
    /// between attempts.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        task_id: &str,
        mut operation: F,
    ) -> Result<T, SchedulerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, SchedulerError>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                warn!(
                    task_id,
                    attempt,
                    max_retries = self.policy.max_retries,
                    "retrying task"
                );

                tokio::select! {
                    _ = ctx.cancelled() => {
                        return Err(cancelled(task_id, last_error));
                    }
                    _ = sleep(self.policy.delay) => {}
                }
            }

            if ctx.is_cancelled() {
                return Err(cancelled(task_id, last_error));
            }

            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) => last_error = Some(e),
            }

            if ctx.is_cancelled() {
                return Err(cancelled(task_id, last_error));
            }
        }

        Err(SchedulerError::RetryFailed {
            task_id: task_id.to_string(),
            attempts: self.policy.max_retries + 1,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

fn cancelled(task_id: &str, last_error: Option<SchedulerError>) -> SchedulerError {
    match last_error {
        Some(e) => SchedulerError::ContextCancelled(format!("task {task_id} stopped after error: {e}")),
        None => SchedulerError::ContextCancelled(format!("task {task_id} stopped before running")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn executor(max_retries: u32, delay_ms: u64) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_retries,
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn fail(msg: &str) -> SchedulerError {
        SchedulerError::TaskExecution(msg.to_string())
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn recovers_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CancellationToken::new();

        let result = executor(3, 5)
            .execute_with_retry(&ctx, "flaky", |attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 { Err(fail("not yet")) } else { Ok(attempt) }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CancellationToken::new();

        let result: Result<(), _> = executor(2, 5)
            .execute_with_retry(&ctx, "broken", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(fail("always"))
                }
            })
            .await;

        match result {
            Err(SchedulerError::RetryFailed { task_id, attempts, last_error }) => {
                assert_eq!(task_id, "broken");
                assert_eq!(attempts, 3);
                assert!(last_error.contains("always"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = CancellationToken::new();

        let result: Result<(), _> = executor(0, 5)
            .execute_with_retry(&ctx, "once", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(fail("nope"))
                }
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::RetryFailed { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_delay() {
        let ctx = CancellationToken::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = executor(5, 10_000)
            .execute_with_retry(&ctx, "slow", |_| async { Err(fail("down")) })
            .await;

        assert!(matches!(result, Err(SchedulerError::ContextCancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_token_skips_first_attempt() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = executor(3, 5)
            .execute_with_retry(&ctx, "late", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::ContextCancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
