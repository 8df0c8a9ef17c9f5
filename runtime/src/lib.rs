//! # Marketplace Events Runtime
//!
//! Delivery machinery of the marketplace messaging core.
//!
//! ## Components
//!
//! - **Handler registry**: handlers per concrete event type ([`registry`])
//! - **Event dispatcher**: concurrent, fault-isolated fan-out ([`dispatcher`])
//! - **Domain event processor**: sequential, fail-fast processing after a unit
//!   of work ([`domain_events`])
//! - **Dead letter policy**: failure classification and backoff ([`policy`])
//!   over pluggable sinks ([`dead_letter`])
//! - **Retry middleware**: bounded retry around one handler call ([`retry`])
//! - **Consumer**: subscription loop feeding the middleware ([`consumer`])
//! - **Publisher**: routed integration event publishing ([`publisher`])
//!
//! ## Example
//!
//! ```ignore
//! use marketplace_events_runtime::prelude::*;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register::<BookingConfirmed, _>(SendConfirmationEmail::new(mailer));
//! let dispatcher = EventDispatcher::new(Arc::new(registry));
//!
//! dispatcher.publish(&booking_confirmed).await;
//! ```

/// Background consumers
pub mod consumer;

/// Dead letter records and sinks
pub mod dead_letter;

/// Concurrent in-process dispatch
pub mod dispatcher;

/// Sequential domain event processing
pub mod domain_events;

/// Prometheus metrics for observability
pub mod metrics;

/// Failure classification and backoff
pub mod policy;

/// Routed integration event publishing
pub mod publisher;

/// Handler registry
pub mod registry;

/// Retry middleware with exponential backoff
pub mod retry;

pub use consumer::{ConsumerError, ConsumerHandle, ConsumerStats, MessageConsumer};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterSink, DeadLetterStatus, InMemoryDeadLetterQueue,
    MessageBusDeadLetterSink,
};
pub use dispatcher::{DispatchReport, EventDispatcher};
pub use domain_events::{DomainEventBuffer, DomainEventProcessor, ProcessError};
pub use policy::{DeadLetterPolicyOptions, DeadLetterService};
pub use publisher::IntegrationEventPublisher;
pub use registry::HandlerRegistry;
pub use retry::{DeliveryOutcome, RetryError, RetryMiddleware};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        DeadLetterPolicyOptions, DeadLetterService, DeliveryOutcome, DomainEventBuffer,
        DomainEventProcessor, EventDispatcher, HandlerRegistry, InMemoryDeadLetterQueue,
        IntegrationEventPublisher, MessageConsumer, RetryMiddleware,
    };
    pub use marketplace_events_core::prelude::*;
    pub use std::sync::Arc;
}
