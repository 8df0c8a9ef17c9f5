//! Bounded retry with exponential backoff around a single handler invocation.
//!
//! [`RetryMiddleware::execute_with_retry`] runs a handler until it succeeds,
//! until the [`DeadLetterService`] decides the failure is permanent (the
//! message is then dead-lettered), or until the cancellation token fires.
//!
//! ```text
//! Attempting(n) ── ok ─────────────────────────────▶ Delivered
//!      │
//!      ├─ err, should_retry = false ──▶ dead letter ▶ DeadLettered
//!      │
//!      └─ err, should_retry = true ──▶ sleep(retry_delay(n)) ──▶ Attempting(n + 1)
//! ```
//!
//! Cancellation is checked before each attempt and raced against every
//! backoff sleep; it is never retried and never dead-lettered. A handler
//! panic counts as a permanent `Panic` failure and is dead-lettered.
//!
//! # Example
//!
//! ```rust
//! use marketplace_events_core::handler::{handler_fn, HandlerError};
//! use marketplace_events_runtime::dead_letter::InMemoryDeadLetterQueue;
//! use marketplace_events_runtime::policy::{DeadLetterPolicyOptions, DeadLetterService};
//! use marketplace_events_runtime::retry::{DeliveryOutcome, RetryMiddleware};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dlq = InMemoryDeadLetterQueue::default();
//! let policy = DeadLetterService::new(DeadLetterPolicyOptions::default(), Arc::new(dlq.clone()));
//! let middleware = RetryMiddleware::new(Arc::new(policy));
//!
//! let handler = handler_fn("reject", |_: String, _| async {
//!     Err(HandlerError::validation("unknown provider"))
//! });
//! let outcome = middleware
//!     .execute_with_retry(&"hire-42".to_string(), &handler, "hires", &CancellationToken::new())
//!     .await?;
//!
//! assert_eq!(outcome, DeliveryOutcome::DeadLettered);
//! assert_eq!(dlq.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::dead_letter::DeadLetterError;
use crate::metrics::RetryMetrics;
use crate::policy::DeadLetterService;
use futures::FutureExt;
use marketplace_events_core::handler::{EventHandler, HandlerError};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How a message left the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler succeeded.
    Delivered,
    /// The handler failed permanently and the message was dead-lettered.
    DeadLettered,
}

impl DeliveryOutcome {
    /// Whether the handler succeeded.
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Why the retry loop could not reach an outcome.
#[derive(Error, Debug, Clone)]
pub enum RetryError {
    /// The cancellation token fired or the handler reported cancellation.
    #[error("Message handling cancelled")]
    Cancelled,

    /// The message failed permanently and the dead letter sink failed too.
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}

/// Wraps handler invocations with the dead letter policy.
#[derive(Clone)]
pub struct RetryMiddleware {
    policy: Arc<DeadLetterService>,
}

impl RetryMiddleware {
    /// Middleware driven by `policy`.
    #[must_use]
    pub const fn new(policy: Arc<DeadLetterService>) -> Self {
        Self { policy }
    }

    /// The policy in use.
    #[must_use]
    pub fn policy(&self) -> &DeadLetterService {
        &self.policy
    }

    /// Handle `message`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// - [`RetryError::Cancelled`] if `cancel` fires before or between
    ///   attempts, or the handler returns `HandlerError::Cancelled`
    /// - [`RetryError::DeadLetter`] if dead-lettering a permanently failed
    ///   message fails
    pub async fn execute_with_retry<M, H>(
        &self,
        message: &M,
        handler: &H,
        source_queue: &str,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome, RetryError>
    where
        M: Serialize + Send + Sync,
        H: EventHandler<M> + ?Sized,
    {
        let handler_name = handler.name();
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                tracing::debug!(
                    attempt,
                    handler = handler_name,
                    source_queue,
                    "Cancelled before attempt"
                );
                return Err(RetryError::Cancelled);
            }

            tracing::debug!(attempt, handler = handler_name, source_queue, "Handling message");
            RetryMetrics::record_attempt(handler_name);

            let err = match invoke(handler, message, cancel).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(
                            attempt,
                            handler = handler_name,
                            source_queue,
                            "Message handled after retry"
                        );
                        RetryMetrics::record_success(handler_name);
                    }
                    return Ok(DeliveryOutcome::Delivered);
                },
                Err(err) => err,
            };

            if err.is_cancelled() || cancel.is_cancelled() {
                tracing::debug!(attempt, handler = handler_name, source_queue, "Handler cancelled");
                return Err(RetryError::Cancelled);
            }

            if !self.policy.should_retry(&err, attempt) {
                tracing::error!(
                    attempt,
                    handler = handler_name,
                    source_queue,
                    kind = err.kind(),
                    error = %err,
                    "Message handling failed permanently"
                );
                RetryMetrics::record_exhausted(handler_name);
                self.policy
                    .send_to_dead_letter(message, &err, handler_name, source_queue, attempt)
                    .await?;
                return Ok(DeliveryOutcome::DeadLettered);
            }

            let delay = self.policy.retry_delay(attempt);
            tracing::warn!(
                attempt,
                handler = handler_name,
                source_queue,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Message handling failed, retrying..."
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(
                        attempt,
                        handler = handler_name,
                        source_queue,
                        "Cancelled during backoff"
                    );
                    return Err(RetryError::Cancelled);
                }
                () = sleep(delay) => {}
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

/// One handler call, with panics (while building or polling the future)
/// turned into [`HandlerError::panicked`].
async fn invoke<M, H>(
    handler: &H,
    message: &M,
    cancel: &CancellationToken,
) -> Result<(), HandlerError>
where
    M: Sync,
    H: EventHandler<M> + ?Sized,
{
    let built = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message, cancel)));
    let invocation = match built {
        Ok(invocation) => invocation,
        Err(payload) => return Err(HandlerError::panicked(payload.as_ref())),
    };
    AssertUnwindSafe(invocation)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(HandlerError::panicked(payload.as_ref())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::dead_letter::{DeadLetterEntry, DeadLetterSink, InMemoryDeadLetterQueue, SinkFuture};
    use crate::policy::DeadLetterPolicyOptions;
    use marketplace_events_core::handler::{HandlerError, handler_fn};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn middleware(max_attempts: u32) -> (RetryMiddleware, InMemoryDeadLetterQueue) {
        let dlq = InMemoryDeadLetterQueue::new(100);
        let options = DeadLetterPolicyOptions::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(1))
            .build();
        let policy = DeadLetterService::new(options, Arc::new(dlq.clone()));
        (RetryMiddleware::new(Arc::new(policy)), dlq)
    }

    /// Fails with `error` for the first `failures` calls, then succeeds.
    fn flaky(
        failures: u32,
        error: HandlerError,
        calls: &Arc<AtomicU32>,
    ) -> impl EventHandler<String> {
        let calls = Arc::clone(calls);
        handler_fn("flaky", move |_: String, _| {
            let calls = Arc::clone(&calls);
            let error = error.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < failures { Err(error) } else { Ok(()) }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_once() {
        let (middleware, dlq) = middleware(3);
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(u32::MAX, HandlerError::timeout("search down"), &calls);

        let start = Instant::now();
        let outcome = middleware
            .execute_with_retry(&"job-1".to_string(), &handler, "jobs", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 3);
        assert_eq!(entries[0].handler_type, "flaky");
        assert_eq!(entries[0].source_queue, "jobs");
        assert_eq!(entries[0].error_kind, "Timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_retry_skips_dead_letter() {
        let (middleware, dlq) = middleware(3);
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(1, HandlerError::io("connection reset"), &calls);

        let outcome = middleware
            .execute_with_retry(&"job-2".to_string(), &handler, "jobs", &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_delivered());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_dead_lettered_after_one_attempt() {
        let (middleware, dlq) = middleware(5);
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(u32::MAX, HandlerError::validation("missing postcode"), &calls);

        let outcome = middleware
            .execute_with_retry(&"job-3".to_string(), &handler, "jobs", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dlq.peek().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_first_attempt() {
        let (middleware, dlq) = middleware(3);
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(0, HandlerError::Cancelled, &calls);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = middleware
            .execute_with_retry(&"job-4".to_string(), &handler, "jobs", &cancel)
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn handler_cancellation_is_not_retried_or_dead_lettered() {
        let (middleware, dlq) = middleware(3);
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(u32::MAX, HandlerError::Cancelled, &calls);

        let result = middleware
            .execute_with_retry(&"job-5".to_string(), &handler, "jobs", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dlq.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_exits_without_dead_letter() {
        let (middleware, dlq) = middleware(10);
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(u32::MAX, HandlerError::broker("leader not available"), &calls);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let result = middleware
            .execute_with_retry(&"job-6".to_string(), &handler, "jobs", &cancel)
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        // Attempt 1 at t=0, attempt 2 at t=100ms, cancelled during the 200ms backoff.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_attempt_exits_without_dead_letter() {
        let (middleware, dlq) = middleware(1);
        let cancel = CancellationToken::new();
        let handler = handler_fn("shutdown-aware", |_: String, cancel: CancellationToken| {
            async move {
                cancel.cancel();
                Err(HandlerError::io("connection closed during shutdown"))
            }
        });

        let result = middleware
            .execute_with_retry(&"job-8".to_string(), &handler, "jobs", &cancel)
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_is_dead_lettered_without_retry() {
        let (middleware, dlq) = middleware(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let handler = handler_fn("explode", move |_: String, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { panic!("invariant broken") }
        });

        let outcome = middleware
            .execute_with_retry(&"job-9".to_string(), &handler, "jobs", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entry = dlq.peek().unwrap();
        assert_eq!(entry.error_kind, "Panic");
        assert_eq!(entry.error_message, "Panic: invariant broken");
        assert_eq!(entry.attempt_count, 1);
    }

    #[tokio::test]
    async fn handler_panicking_before_its_future_exists_is_dead_lettered() {
        let (middleware, dlq) = middleware(3);
        let handler = handler_fn("reject-empty", |id: String, _| {
            assert!(!id.is_empty(), "empty job id");
            async { Ok(()) }
        });

        let outcome = middleware
            .execute_with_retry(&String::new(), &handler, "jobs", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(dlq.peek().unwrap().error_kind, "Panic");
    }

    #[tokio::test]
    async fn dead_letter_sink_failure_propagates() {
        struct RejectingSink;

        impl DeadLetterSink for RejectingSink {
            fn store<'a>(&'a self, _entry: &'a DeadLetterEntry) -> SinkFuture<'a> {
                Box::pin(async { Err(DeadLetterError::Storage("connection refused".to_string())) })
            }
        }

        let policy =
            DeadLetterService::new(DeadLetterPolicyOptions::default(), Arc::new(RejectingSink));
        let middleware = RetryMiddleware::new(Arc::new(policy));
        let calls = Arc::new(AtomicU32::new(0));
        let handler = flaky(u32::MAX, HandlerError::business_rule("job closed"), &calls);

        let result = middleware
            .execute_with_retry(&"job-7".to_string(), &handler, "jobs", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RetryError::DeadLetter(DeadLetterError::Storage(_)))));
    }
}
