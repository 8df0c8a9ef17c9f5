//! Background consumer: subscription → decode → retry middleware.
//!
//! [`MessageConsumer::spawn`] subscribes to a destination, then hands every
//! envelope to a handler through the [`RetryMiddleware`]. Envelopes whose
//! payload cannot be decoded are dead-lettered straight away as
//! `Serialization` failures. The task ends when the cancellation token fires
//! or the stream ends, and fails if the dead letter sink fails.

use crate::dead_letter::{DeadLetterEntry, DeadLetterError};
use crate::metrics::MessageBusMetrics;
use crate::retry::{DeliveryOutcome, RetryError, RetryMiddleware};
use futures::StreamExt;
use marketplace_events_core::event::short_type_name;
use marketplace_events_core::handler::{EventHandler, kinds};
use marketplace_events_core::message_bus::{Envelope, EnvelopeStream, MessageBus, MessageBusError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a consumer task stopped abnormally.
#[derive(Error, Debug, Clone)]
pub enum ConsumerError {
    /// A message failed permanently and could not be dead-lettered.
    #[error("Consumer stopped: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

/// Counters reported when a consumer task ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Envelopes received
    pub received: u64,
    /// Envelopes skipped by the type filter
    pub skipped: u64,
    /// Messages handled successfully
    pub delivered: u64,
    /// Messages dead-lettered
    pub dead_lettered: u64,
}

/// Handle to a running consumer task.
pub type ConsumerHandle = JoinHandle<Result<ConsumerStats, ConsumerError>>;

/// Spawns consumer tasks on a message bus.
#[derive(Clone)]
pub struct MessageConsumer {
    bus: Arc<dyn MessageBus>,
    middleware: RetryMiddleware,
    cancel: CancellationToken,
    filter_by_type: bool,
}

impl MessageConsumer {
    /// Consumer reading from `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, middleware: RetryMiddleware) -> Self {
        Self {
            bus,
            middleware,
            cancel: CancellationToken::new(),
            filter_by_type: false,
        }
    }

    /// Stop consumer tasks (and in-flight retries) when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Skip envelopes whose `message_type` is not the handler's message
    /// type. Needed on shared destinations.
    #[must_use]
    pub const fn filter_by_type(mut self, enabled: bool) -> Self {
        self.filter_by_type = enabled;
        self
    }

    /// Subscribe and start consuming in a background task.
    ///
    /// The subscription exists when this returns, so messages published
    /// afterwards are seen by the task.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the subscription cannot be created.
    pub async fn spawn<M, H>(
        &self,
        subscription: Option<&str>,
        handler: H,
    ) -> Result<ConsumerHandle, MessageBusError>
    where
        M: DeserializeOwned + Serialize + Send + Sync + 'static,
        H: EventHandler<M> + 'static,
    {
        let source_queue = self.bus.resolve(subscription).to_string();
        let stream = self.bus.subscribe(Some(&source_queue)).await?;

        tracing::info!(
            source_queue = %source_queue,
            handler = handler.name(),
            "Consumer started"
        );

        let worker = Worker {
            source_queue,
            middleware: self.middleware.clone(),
            cancel: self.cancel.clone(),
            expected_type: self
                .filter_by_type
                .then(|| short_type_name(std::any::type_name::<M>())),
        };

        Ok(tokio::spawn(worker.run::<M, H>(stream, handler)))
    }
}

struct Worker {
    source_queue: String,
    middleware: RetryMiddleware,
    cancel: CancellationToken,
    expected_type: Option<&'static str>,
}

impl Worker {
    async fn run<M, H>(
        self,
        mut stream: EnvelopeStream,
        handler: H,
    ) -> Result<ConsumerStats, ConsumerError>
    where
        M: DeserializeOwned + Serialize + Send + Sync + 'static,
        H: EventHandler<M> + 'static,
    {
        let mut stats = ConsumerStats::default();

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(item) = next else {
                tracing::info!(source_queue = %self.source_queue, "Subscription ended");
                break;
            };

            let envelope = match item {
                Ok(envelope) => envelope,
                Err(err) => {
                    MessageBusMetrics::record_decode_error(&self.source_queue);
                    tracing::warn!(
                        source_queue = %self.source_queue,
                        error = %err,
                        "Failed to receive message"
                    );
                    continue;
                },
            };

            stats.received += 1;
            MessageBusMetrics::record_consume(&self.source_queue);

            if self
                .expected_type
                .is_some_and(|expected| envelope.message_type != expected)
            {
                tracing::trace!(
                    message_type = %envelope.message_type,
                    "Skipping message of another type"
                );
                stats.skipped += 1;
                continue;
            }

            match self.handle::<M, H>(&envelope, &handler).await {
                Ok(DeliveryOutcome::Delivered) => stats.delivered += 1,
                Ok(DeliveryOutcome::DeadLettered) => stats.dead_lettered += 1,
                Err(RetryError::Cancelled) => break,
                Err(RetryError::DeadLetter(err)) => {
                    tracing::error!(
                        source_queue = %self.source_queue,
                        error = %err,
                        "Dead letter sink failed, stopping consumer"
                    );
                    return Err(ConsumerError::DeadLetter(err));
                },
            }
        }

        tracing::info!(
            source_queue = %self.source_queue,
            received = stats.received,
            delivered = stats.delivered,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }

    async fn handle<M, H>(
        &self,
        envelope: &Envelope,
        handler: &H,
    ) -> Result<DeliveryOutcome, RetryError>
    where
        M: DeserializeOwned + Serialize + Send + Sync,
        H: EventHandler<M>,
    {
        match envelope.decode::<M>() {
            Ok(message) => {
                self.middleware
                    .execute_with_retry(&message, handler, &self.source_queue, &self.cancel)
                    .await
            },
            Err(err) => {
                MessageBusMetrics::record_decode_error(&self.source_queue);
                let payload = serde_json::from_slice(&envelope.payload).unwrap_or_else(|_| {
                    let text = String::from_utf8_lossy(&envelope.payload).into_owned();
                    serde_json::Value::String(text)
                });
                let entry = DeadLetterEntry::new(
                    envelope.message_type.clone(),
                    payload,
                    kinds::SERIALIZATION,
                    err.to_string(),
                    handler.name(),
                    self.source_queue.clone(),
                    1,
                );
                self.middleware.policy().store(&entry).await?;
                Ok(DeliveryOutcome::DeadLettered)
            },
        }
    }
}
