//! # Marketplace Events Core
//!
//! Transport-agnostic building blocks of the marketplace messaging core.
//!
//! - [`event`]: event identity, domain events and integration events
//! - [`handler`]: the handler contract and failure classification
//! - [`message_bus`]: the broker abstraction and the wire envelope
//! - [`routing`]: topic strategy selection for integration events
//!
//! Dispatching, retries and dead-lettering live in
//! `marketplace-events-runtime`; concrete brokers live in their own crates.
//!
//! ## Example
//!
//! ```
//! use marketplace_events_core::prelude::*;
//! use std::collections::BTreeMap;
//!
//! let options = RoutingOptions {
//!     strategy: TopicStrategy::MultipleByDomain,
//!     default_destination: "marketplace".into(),
//!     domain_destinations: BTreeMap::from([("users".into(), "users-events".into())]),
//! };
//! let selector = TopicSelector::new(options, RoutingTable::new());
//!
//! let topic = selector.select_topic_by_path("app::modules::users::UserRegistered");
//! assert_eq!(topic, "users-events");
//! assert_eq!(selector.select_topic_by_path("app::shared::Heartbeat"), "marketplace");
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;
pub use uuid::Uuid;

pub mod event;
pub mod handler;
pub mod message_bus;
pub mod routing;

/// Commonly used items.
pub mod prelude {
    pub use crate::event::{
        AsAny, DomainEvent, DomainEventMetadata, Event, EventMetadata, IntegrationEvent,
        IntegrationEventMetadata,
    };
    pub use crate::handler::{EventHandler, HandlerError, HandlerFuture, handler_fn, kinds};
    pub use crate::message_bus::{Envelope, EnvelopeStream, MessageBus, MessageBusError};
    pub use crate::routing::{
        RoutingMetadata, RoutingOptions, RoutingTable, TopicSelector, TopicStrategy,
    };
    pub use tokio_util::sync::CancellationToken;
}
