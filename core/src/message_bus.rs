//! Message transport abstraction.
//!
//! The [`MessageBus`] trait is the only way the messaging core talks to a
//! broker. It offers three operations:
//!
//! - [`MessageBus::send`]: point-to-point delivery to a queue (one consumer
//!   receives each message)
//! - [`MessageBus::publish`]: broadcast to a topic (every subscription
//!   receives a copy)
//! - [`MessageBus::subscribe`]: consume a destination as a stream of
//!   [`Envelope`]s
//!
//! When no destination is given, the bus falls back to its configured default
//! destination.
//!
//! # Delivery semantics
//!
//! - **At-least-once**: subscribers may see duplicates and must be idempotent
//!   (use [`Envelope::message_id`])
//! - **Opaque payloads**: the bus never inspects [`Envelope::payload`]
//!
//! # Implementations
//!
//! - `InMemoryMessageBus` (testing crate): process-local, used for tests and
//!   the `testing` environment
//! - `RedisMessageBus`: development broker
//! - `RedpandaMessageBus`: production broker (Kafka protocol)

use crate::event::{IntegrationEvent, short_type_name};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the correlation id of a conversation.
pub const CORRELATION_ID_HEADER: &str = "correlation_id";

/// Errors raised by message bus operations.
#[derive(Error, Debug, Clone)]
pub enum MessageBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish to a topic
    #[error("Publish failed for destination '{destination}': {reason}")]
    PublishFailed {
        /// Target topic
        destination: String,
        /// Why it failed
        reason: String,
    },

    /// Failed to send to a queue
    #[error("Send failed for destination '{destination}': {reason}")]
    SendFailed {
        /// Target queue
        destination: String,
        /// Why it failed
        reason: String,
    },

    /// Failed to subscribe
    #[error("Subscription '{subscription}' failed: {reason}")]
    SubscriptionFailed {
        /// Subscription name
        subscription: String,
        /// Why it failed
        reason: String,
    },

    /// Failed to serialize an envelope or payload
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize an envelope or payload
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Transport unit carried by every [`MessageBus`].
///
/// Built from an integration event with [`Envelope::from_event`]; the payload
/// is the event serialized as JSON. Adapters frame the whole envelope with
/// [`Envelope::to_bytes`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id (the event id for integration events)
    pub message_id: Uuid,
    /// Short message type, e.g. `UserRegistered`
    pub message_type: String,
    /// Fully qualified type path, used for routing
    pub type_path: String,
    /// Originating module
    pub source: String,
    /// Payload schema version
    pub schema_version: String,
    /// When the underlying event occurred
    pub occurred_at: DateTime<Utc>,
    /// JSON-encoded payload
    pub payload: Vec<u8>,
    /// Free-form headers (correlation id, tenant, ...)
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Wrap an integration event.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SerializationFailed`] if the event cannot be
    /// encoded as JSON.
    pub fn from_event<E>(event: &E) -> Result<Self, MessageBusError>
    where
        E: IntegrationEvent + Serialize,
    {
        let payload = serde_json::to_vec(event)
            .map_err(|e| MessageBusError::SerializationFailed(e.to_string()))?;

        Ok(Self {
            message_id: event.id(),
            message_type: event.event_type().to_string(),
            type_path: event.type_path().to_string(),
            source: event.source().to_string(),
            schema_version: event.schema_version().to_string(),
            occurred_at: event.occurred_at(),
            payload,
            headers: BTreeMap::new(),
        })
    }

    /// Wrap an arbitrary serializable message that is not an integration
    /// event (commands, dead-letter records).
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SerializationFailed`] if the message cannot
    /// be encoded as JSON.
    pub fn from_message<M>(message: &M, source: impl Into<String>) -> Result<Self, MessageBusError>
    where
        M: Serialize,
    {
        let payload = serde_json::to_vec(message)
            .map_err(|e| MessageBusError::SerializationFailed(e.to_string()))?;
        let type_path = std::any::type_name::<M>();

        Ok(Self {
            message_id: Uuid::now_v7(),
            message_type: short_type_name(type_path).to_string(),
            type_path: type_path.to_string(),
            source: source.into(),
            schema_version: crate::event::DEFAULT_SCHEMA_VERSION.to_string(),
            occurred_at: Utc::now(),
            payload,
            headers: BTreeMap::new(),
        })
    }

    /// Attach a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Read a header.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Correlation id header, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID_HEADER)
    }

    /// Decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::DeserializationFailed`] if the payload is not
    /// valid JSON for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageBusError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            MessageBusError::DeserializationFailed(format!(
                "payload of '{}' is not a valid {}: {e}",
                self.message_type,
                short_type_name(std::any::type_name::<T>())
            ))
        })
    }

    /// Frame the envelope for the wire (bincode).
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SerializationFailed`] if framing fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageBusError> {
        bincode::serialize(self).map_err(|e| MessageBusError::SerializationFailed(e.to_string()))
    }

    /// Read an envelope framed with [`Envelope::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::DeserializationFailed`] if the bytes are not
    /// a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageBusError> {
        bincode::deserialize(bytes)
            .map_err(|e| MessageBusError::DeserializationFailed(e.to_string()))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ id: {}, type: {}, size: {} bytes }}",
            self.message_id,
            self.message_type,
            self.payload.len()
        )
    }
}

/// Stream of envelopes from a subscription.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Envelope, MessageBusError>> + Send>>;

/// Future returned by [`MessageBus`] operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MessageBusError>> + Send + 'a>>;

/// Broker capability: point-to-point send, topic publish, subscribe.
///
/// All implementations must be `Send + Sync`; the bus is shared as
/// `Arc<dyn MessageBus>` between publishers, consumers and dead-letter sinks.
pub trait MessageBus: Send + Sync {
    /// Send to a queue. `None` targets the default destination.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SendFailed`] if the broker rejects the message.
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()>;

    /// Publish to a topic. `None` targets the default destination.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::PublishFailed`] if the broker rejects the message.
    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()>;

    /// Subscribe to a destination. `None` subscribes to the default destination.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SubscriptionFailed`] if the consumer cannot
    /// be created.
    fn subscribe<'a>(&'a self, subscription: Option<&'a str>) -> BusFuture<'a, EnvelopeStream>;

    /// Destination used when none is given.
    fn default_destination(&self) -> &str;

    /// Resolve an optional destination against the default.
    fn resolve<'a>(&'a self, destination: Option<&'a str>) -> &'a str {
        destination.unwrap_or_else(|| self.default_destination())
    }
}
