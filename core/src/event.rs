//! Event contracts shared by every marketplace module.
//!
//! Two event families live here:
//!
//! - [`DomainEvent`]: an in-process record of a state transition inside one
//!   aggregate. Carries the aggregate identity and the aggregate version at the
//!   moment the event was recorded.
//! - [`IntegrationEvent`]: a cross-module message, usually translated from a
//!   domain event, carrying the originating module and a schema version.
//!
//! Both share the immutable [`EventMetadata`] header (time-sortable id plus UTC
//! timestamp) assigned at construction.
//!
//! # Example
//!
//! ```
//! use marketplace_events_core::event::{Event, EventMetadata};
//!
//! #[derive(Debug)]
//! struct CacheInvalidated {
//!     metadata: EventMetadata,
//!     key: String,
//! }
//!
//! impl Event for CacheInvalidated {
//!     fn metadata(&self) -> &EventMetadata {
//!         &self.metadata
//!     }
//! }
//!
//! let event = CacheInvalidated { metadata: EventMetadata::new(), key: "providers".into() };
//! assert_eq!(event.event_type(), "CacheInvalidated");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use uuid::Uuid;

/// Default schema version for integration events.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

/// Identity and timestamp shared by every event.
///
/// Fields are private: once constructed, neither the id nor the timestamp can
/// change. The id is a UUID v7, so ids sort by creation time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventMetadata {
    id: Uuid,
    occurred_at: DateTime<Utc>,
}

impl EventMetadata {
    /// Create metadata stamped with a fresh id and the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Create metadata with a fresh id and an explicit timestamp.
    #[must_use]
    pub fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            occurred_at,
        }
    }

    /// The event id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// When the event occurred (UTC).
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Access to the concrete type behind a trait object.
///
/// Implemented for every `'static` type; used by the handler registry to
/// resolve handlers by exact runtime type.
pub trait AsAny: Any {
    /// Borrow `self` as [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An immutable fact that happened.
///
/// Implementors only provide [`Event::metadata`]; the type name and type path
/// are derived from the concrete type.
///
/// When calling [`AsAny::as_any`] through a smart pointer (`Box<dyn Event>`,
/// `Arc<dyn Event>`), dereference first (`(*event).as_any()` or
/// `event.as_ref().as_any()`), otherwise the pointer itself is returned.
pub trait Event: AsAny + Send + Sync + Debug {
    /// Identity and timestamp header.
    fn metadata(&self) -> &EventMetadata;

    /// The event id.
    fn id(&self) -> Uuid {
        self.metadata().id()
    }

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata().occurred_at()
    }

    /// Fully qualified type path, e.g. `app::modules::users::UserRegistered`.
    ///
    /// Topic routing extracts the owning module from this path.
    fn type_path(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Short type name, e.g. `UserRegistered`.
    fn event_type(&self) -> &'static str {
        short_type_name(self.type_path())
    }
}

/// Header of a [`DomainEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEventMetadata {
    event: EventMetadata,
    aggregate_id: Uuid,
    aggregate_version: u64,
}

impl DomainEventMetadata {
    /// Record a new event for `aggregate_id` at `aggregate_version`.
    #[must_use]
    pub fn new(aggregate_id: Uuid, aggregate_version: u64) -> Self {
        Self {
            event: EventMetadata::new(),
            aggregate_id,
            aggregate_version,
        }
    }

    /// Shared identity header.
    #[must_use]
    pub const fn event(&self) -> &EventMetadata {
        &self.event
    }

    /// The owning aggregate.
    #[must_use]
    pub const fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    /// Aggregate version when the event was recorded.
    #[must_use]
    pub const fn aggregate_version(&self) -> u64 {
        self.aggregate_version
    }
}

/// A state transition recorded by one aggregate.
///
/// Ordering between events of the same aggregate is given by
/// [`DomainEvent::aggregate_version`], never by wall-clock time.
pub trait DomainEvent: Event {
    /// Domain header.
    fn domain_metadata(&self) -> &DomainEventMetadata;

    /// The owning aggregate.
    fn aggregate_id(&self) -> Uuid {
        self.domain_metadata().aggregate_id()
    }

    /// Aggregate version when the event was recorded.
    fn aggregate_version(&self) -> u64 {
        self.domain_metadata().aggregate_version()
    }
}

/// Header of an [`IntegrationEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationEventMetadata {
    event: EventMetadata,
    source: String,
    schema_version: String,
}

impl IntegrationEventMetadata {
    /// New header for an event raised by `source` with the default schema version.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event: EventMetadata::new(),
            source: source.into(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
        }
    }

    /// Override the schema version. Only meaningful while building the event.
    #[must_use]
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Shared identity header.
    #[must_use]
    pub const fn event(&self) -> &EventMetadata {
        &self.event
    }

    /// Originating module.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Payload schema version.
    #[must_use]
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }
}

/// A cross-module message published on the message bus.
pub trait IntegrationEvent: Event {
    /// Integration header.
    fn integration_metadata(&self) -> &IntegrationEventMetadata;

    /// Originating module.
    fn source(&self) -> &str {
        self.integration_metadata().source()
    }

    /// Payload schema version, independent of aggregate versions.
    fn schema_version(&self) -> &str {
        self.integration_metadata().schema_version()
    }
}

/// Strip the module path and generic arguments from a type name.
///
/// ```
/// use marketplace_events_core::event::short_type_name;
///
/// assert_eq!(short_type_name("app::modules::users::UserRegistered"), "UserRegistered");
/// assert_eq!(short_type_name("Modules.Jobs.JobPosted"), "JobPosted");
/// assert_eq!(short_type_name("app::Wrapper<app::Inner>"), "Wrapper");
/// ```
#[must_use]
pub fn short_type_name(type_path: &str) -> &str {
    let base = type_path.split('<').next().unwrap_or(type_path);
    let after_colons = base.rsplit("::").next().unwrap_or(base);
    after_colons.rsplit('.').next().unwrap_or(after_colons)
}
