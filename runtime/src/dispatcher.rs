//! Concurrent, fault-isolated in-process event fan-out.
//!
//! [`EventDispatcher::publish`] runs every handler registered for the event's
//! exact type concurrently and waits for all of them. A failing (or panicking)
//! handler is logged and counted; it never affects its siblings or the caller.

use crate::metrics::DispatchMetrics;
use crate::registry::HandlerRegistry;
use futures::FutureExt;
use futures::future::join_all;
use marketplace_events_core::event::Event;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Short type name of the dispatched event
    pub event_type: &'static str,
    /// Handlers invoked
    pub handlers: usize,
    /// Handlers that failed or panicked
    pub failed_handlers: Vec<&'static str>,
}

impl DispatchReport {
    /// Number of failed handlers.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failed_handlers.len()
    }

    /// Whether every handler succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed_handlers.is_empty()
    }
}

/// Fans events out to registered handlers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
}

impl EventDispatcher {
    /// Dispatcher over `registry`.
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

    /// Dispatch one event. Never fails.
    pub async fn publish<E>(&self, event: &E)
    where
        E: Event + ?Sized,
    {
        self.publish_with_report(event).await;
    }

    /// Dispatch a batch, one event at a time.
    pub async fn publish_all<'e, I, E>(&self, events: I)
    where
        I: IntoIterator<Item = &'e E>,
        E: Event + ?Sized + 'e,
    {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Dispatch one event and report which handlers failed.
    pub async fn publish_with_report<E>(&self, event: &E) -> DispatchReport
    where
        E: Event + ?Sized,
    {
        let event_type = event.event_type();
        let handlers = self.registry.handlers_for(event.as_any());

        if handlers.is_empty() {
            tracing::debug!(event_type, event_id = %event.id(), "No handlers registered");
            return DispatchReport {
                event_type,
                ..DispatchReport::default()
            };
        }

        let start = Instant::now();
        // Build every invocation up front so no `&dyn Any` lives across an await.
        let invocations: Vec<_> = {
            let any = event.as_any();
            handlers
                .iter()
                .map(|handler| {
                    // Handlers may panic while building their future, not only while polling it.
                    let invocation = panic::catch_unwind(AssertUnwindSafe(|| {
                        AssertUnwindSafe(handler.handle_any(any, &self.cancel)).catch_unwind()
                    }));
                    async move {
                        let outcome = match invocation {
                            Ok(invocation) => invocation.await,
                            Err(payload) => Err(payload),
                        };
                        match outcome {
                            Ok(Ok(())) => None,
                            Ok(Err(err)) => {
                                tracing::error!(
                                    event_type,
                                    handler = handler.name(),
                                    error = %err,
                                    "Event handler failed"
                                );
                                Some(handler.name())
                            },
                            Err(_) => {
                                tracing::error!(
                                    event_type,
                                    handler = handler.name(),
                                    "Event handler panicked"
                                );
                                Some(handler.name())
                            },
                        }
                    }
                })
                .collect()
        };

        let failed_handlers: Vec<_> = join_all(invocations).await.into_iter().flatten().collect();

        let report = DispatchReport {
            event_type,
            handlers: handlers.len(),
            failed_handlers,
        };

        DispatchMetrics::record_dispatch(report.handlers, report.failures(), start.elapsed());
        tracing::debug!(
            event_type,
            event_id = %event.id(),
            handlers = report.handlers,
            failures = report.failures(),
            "Event dispatched"
        );

        report
    }
}
