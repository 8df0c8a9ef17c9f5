//! Routed publishing of integration events.

use crate::metrics::MessageBusMetrics;
use marketplace_events_core::event::IntegrationEvent;
use marketplace_events_core::message_bus::{Envelope, MessageBus, MessageBusError};
use marketplace_events_core::routing::TopicSelector;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Publishes integration events to the destination chosen by a
/// [`TopicSelector`].
#[derive(Clone)]
pub struct IntegrationEventPublisher {
    bus: Arc<dyn MessageBus>,
    selector: Arc<TopicSelector>,
}

impl IntegrationEventPublisher {
    /// Publisher over `bus`, routed by `selector`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, selector: Arc<TopicSelector>) -> Self {
        Self { bus, selector }
    }

    /// The routing in use.
    #[must_use]
    pub fn selector(&self) -> &TopicSelector {
        &self.selector
    }

    /// Publish `event` to its routed destination.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the event cannot be serialized or the
    /// broker rejects it.
    pub async fn publish<E>(&self, event: &E) -> Result<(), MessageBusError>
    where
        E: IntegrationEvent + Serialize,
    {
        self.publish_envelope(Envelope::from_event(event)?).await
    }

    /// Publish an envelope built by the caller (extra headers, correlation
    /// ids). Routed by the envelope's type path.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the broker rejects the envelope.
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<(), MessageBusError> {
        let destination = self.selector.select_topic_by_path(&envelope.type_path);
        let start = Instant::now();

        match self.bus.publish(&envelope, Some(destination)).await {
            Ok(()) => {
                MessageBusMetrics::record_publish(destination, start.elapsed());
                tracing::debug!(
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    destination,
                    "Integration event published"
                );
                Ok(())
            },
            Err(err) => {
                MessageBusMetrics::record_publish_error(destination);
                tracing::error!(
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    destination,
                    error = %err,
                    "Failed to publish integration event"
                );
                Err(err)
            },
        }
    }
}
