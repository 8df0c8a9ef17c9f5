//! Dead letter policy: failure classification, backoff and the terminal sink.
//!
//! # Example
//!
//! ```
//! use marketplace_events_core::handler::HandlerError;
//! use marketplace_events_runtime::dead_letter::InMemoryDeadLetterQueue;
//! use marketplace_events_runtime::policy::{DeadLetterPolicyOptions, DeadLetterService};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let options = DeadLetterPolicyOptions::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//! let service = DeadLetterService::new(options, Arc::new(InMemoryDeadLetterQueue::default()));
//!
//! assert!(service.should_retry(&HandlerError::timeout("slow"), 1));
//! assert!(!service.should_retry(&HandlerError::validation("bad email"), 1));
//! assert_eq!(service.retry_delay(2), Duration::from_millis(100));
//! ```

use crate::dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterSink};
use crate::metrics::DeadLetterMetrics;
use marketplace_events_core::event::short_type_name;
use marketplace_events_core::handler::{HandlerError, kinds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Retry budget, backoff shape and failure classification.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
/// - non-retryable: `InvalidArgument`, `Validation`, `BusinessRule`, `Serialization`
/// - retryable: `Timeout`, `Io`, `Broker`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterPolicyOptions {
    /// Total handler invocations allowed, first one included
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap for the exponential backoff
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Kinds that are dead-lettered on first failure
    pub non_retryable_kinds: BTreeSet<String>,
    /// Kinds known to be transient
    pub retryable_kinds: BTreeSet<String>,
}

impl Default for DeadLetterPolicyOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DeadLetterPolicyOptions {
    /// Builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> DeadLetterPolicyOptionsBuilder {
        DeadLetterPolicyOptionsBuilder {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            non_retryable_kinds: [
                kinds::INVALID_ARGUMENT,
                kinds::VALIDATION,
                kinds::BUSINESS_RULE,
                kinds::SERIALIZATION,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            retryable_kinds: [kinds::TIMEOUT, kinds::IO, kinds::BROKER]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Backoff before attempt `attempt_count + 1`.
    ///
    /// `min(initial_delay × multiplier^(attempt_count - 1), max_delay)`.
    /// Attempt counts below 1 are treated as 1. Never overflows: huge attempt
    /// counts saturate at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt_count.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);

        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Builder for [`DeadLetterPolicyOptions`].
#[derive(Debug, Clone)]
pub struct DeadLetterPolicyOptionsBuilder {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    non_retryable_kinds: BTreeSet<String>,
    retryable_kinds: BTreeSet<String>,
}

impl DeadLetterPolicyOptionsBuilder {
    /// Total invocations allowed (at least 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Backoff cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor (values below 1.0 are treated as 1.0).
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Replace the non-retryable kind list.
    #[must_use]
    pub fn non_retryable_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_retryable_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the retryable kind list.
    #[must_use]
    pub fn retryable_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Build the options.
    #[must_use]
    pub fn build(self) -> DeadLetterPolicyOptions {
        DeadLetterPolicyOptions {
            max_attempts: self.max_attempts.max(1),
            initial_delay: self.initial_delay,
            max_delay: self.max_delay.max(self.initial_delay),
            multiplier: self.multiplier,
            non_retryable_kinds: self.non_retryable_kinds,
            retryable_kinds: self.retryable_kinds,
        }
    }
}

/// Classifies failures, computes backoff and dead-letters messages.
///
/// Immutable after construction; share as `Arc<DeadLetterService>`.
pub struct DeadLetterService {
    options: DeadLetterPolicyOptions,
    sink: Arc<dyn DeadLetterSink>,
}

impl DeadLetterService {
    /// Service writing to `sink`.
    #[must_use]
    pub fn new(options: DeadLetterPolicyOptions, sink: Arc<dyn DeadLetterSink>) -> Self {
        Self { options, sink }
    }

    /// Active options.
    #[must_use]
    pub const fn options(&self) -> &DeadLetterPolicyOptions {
        &self.options
    }

    /// Whether another attempt should follow a failure at `attempt_count`.
    ///
    /// Cancellation, panics and non-retryable kinds are never retried. Everything
    /// else, including kinds in neither list, is retried while the budget
    /// lasts.
    #[must_use]
    pub fn should_retry(&self, error: &HandlerError, attempt_count: u32) -> bool {
        if error.is_cancelled() || error.is_panic() {
            return false;
        }
        if self.options.non_retryable_kinds.contains(error.kind()) {
            return false;
        }
        if attempt_count >= self.options.max_attempts {
            return false;
        }
        if !self.options.retryable_kinds.contains(error.kind()) {
            tracing::debug!(
                kind = error.kind(),
                "Unclassified failure kind, treating as retryable"
            );
        }
        true
    }

    /// Backoff after a failure at `attempt_count`.
    #[must_use]
    pub fn retry_delay(&self, attempt_count: u32) -> Duration {
        self.options.delay_for_attempt(attempt_count)
    }

    /// Hand a failed message to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Serialization`] if `message` cannot be
    /// encoded as JSON, or the sink's error if storing fails.
    pub async fn send_to_dead_letter<M>(
        &self,
        message: &M,
        error: &HandlerError,
        handler_type: &str,
        source_queue: &str,
        attempt_count: u32,
    ) -> Result<(), DeadLetterError>
    where
        M: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_value(message)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;

        let entry = DeadLetterEntry::new(
            short_type_name(std::any::type_name::<M>()),
            payload,
            error.kind(),
            error.to_string(),
            handler_type,
            source_queue,
            attempt_count,
        );

        self.store(&entry).await
    }

    /// Hand an already-built entry to the sink.
    ///
    /// # Errors
    ///
    /// Propagates the sink's error.
    pub async fn store(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        tracing::error!(
            entry_id = %entry.id,
            message_type = %entry.message_type,
            handler = %entry.handler_type,
            source_queue = %entry.source_queue,
            attempt_count = entry.attempt_count,
            error_kind = %entry.error_kind,
            error = %entry.error_message,
            "Message sent to dead letter"
        );

        match self.sink.store(entry).await {
            Ok(()) => {
                DeadLetterMetrics::record_dead_lettered(&entry.error_kind);
                Ok(())
            },
            Err(err) => {
                DeadLetterMetrics::record_sink_failure();
                tracing::error!(entry_id = %entry.id, error = %err, "Dead letter sink failed");
                Err(err)
            },
        }
    }
}
