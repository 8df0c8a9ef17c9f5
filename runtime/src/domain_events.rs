//! Sequential, fail-fast processing of domain events after a unit of work.
//!
//! Aggregates record domain events into a [`DomainEventBuffer`] while they
//! mutate; once the unit of work commits, the buffered events are handed to
//! [`DomainEventProcessor::process_domain_events`]. Events are processed in
//! order, handlers one at a time, and the first handler failure aborts the
//! rest of the batch.

use crate::registry::HandlerRegistry;
use marketplace_events_core::event::DomainEvent;
use marketplace_events_core::handler::HandlerError;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Domain event processing failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// A handler returned an error; later handlers and events were skipped.
    #[error("Handler '{handler}' failed for {event_type}: {source}")]
    HandlerFailed {
        /// Short type name of the event being processed
        event_type: &'static str,
        /// Handler that failed
        handler: &'static str,
        /// The handler's error
        #[source]
        source: HandlerError,
    },
}

/// Events recorded by an aggregate, waiting for the unit of work to commit.
#[derive(Debug, Default)]
pub struct DomainEventBuffer {
    events: Vec<Box<dyn DomainEvent>>,
}

impl DomainEventBuffer {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event.
    pub fn record<E: DomainEvent>(&mut self, event: E) {
        self.events.push(Box::new(event));
    }

    /// Take every recorded event, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }

    /// Recorded events.
    #[must_use]
    pub fn events(&self) -> &[Box<dyn DomainEvent>] {
        &self.events
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Runs domain event handlers in order, stopping at the first failure.
#[derive(Debug, Clone)]
pub struct DomainEventProcessor {
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
}

impl DomainEventProcessor {
    /// Processor over `registry`.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            cancel: CancellationToken::new(),
        }
    }

    /// Pass `cancel` to every handler invocation.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process `events` in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::HandlerFailed`] for the first handler that
    /// fails. No further handler runs after that.
    pub async fn process_domain_events<'e, I, E>(&self, events: I) -> Result<(), ProcessError>
    where
        I: IntoIterator<Item = &'e E>,
        E: DomainEvent + ?Sized + 'e,
    {
        for event in events {
            let event_type = event.event_type();
            let handlers = self.registry.handlers_for(event.as_any());

            tracing::debug!(
                event_type,
                event_id = %event.id(),
                aggregate_id = %event.aggregate_id(),
                aggregate_version = event.aggregate_version(),
                handlers = handlers.len(),
                "Processing domain event"
            );

            for handler in handlers {
                let invocation = handler.handle_any(event.as_any(), &self.cancel);
                if let Err(source) = invocation.await {
                    tracing::error!(
                        event_type,
                        handler = handler.name(),
                        aggregate_id = %event.aggregate_id(),
                        error = %source,
                        "Domain event handler failed, aborting batch"
                    );
                    return Err(ProcessError::HandlerFailed {
                        event_type,
                        handler: handler.name(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Drain `buffer` and process its events.
    ///
    /// # Errors
    ///
    /// See [`DomainEventProcessor::process_domain_events`]. The buffer is
    /// empty afterwards either way.
    pub async fn process_buffer(&self, buffer: &mut DomainEventBuffer) -> Result<(), ProcessError> {
        let events = buffer.take();
        self.process_domain_events(events.iter().map(|event| &**event))
            .await
    }
}
