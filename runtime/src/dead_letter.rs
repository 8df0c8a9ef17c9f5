//! Dead letter records and the sinks that store them.
//!
//! A [`DeadLetterEntry`] is the terminal record of a message that could not
//! be handled: the original payload plus enough failure context to replay it
//! by hand. Entries are handed to a [`DeadLetterSink`]:
//!
//! - [`InMemoryDeadLetterQueue`]: bounded, process-local (tests, `testing`
//!   environment)
//! - [`MessageBusDeadLetterSink`]: forwards to `{source_queue}.dead-letter` on
//!   the message bus
//! - `PostgresDeadLetterStore` (postgres crate): durable table with a
//!   resolution workflow

use crate::metrics::DeadLetterMetrics;
use chrono::{DateTime, Utc};
use marketplace_events_core::message_bus::{Envelope, MessageBus, MessageBusError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Default suffix appended to a source queue to name its dead-letter
/// destination.
pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Errors raised while dead-lettering a message.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// The failed message could not be serialized for storage.
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    /// The sink refused or failed to store the entry.
    #[error("Dead letter sink failed: {0}")]
    Storage(String),

    /// A stored status string is not recognised.
    #[error("Invalid dead letter status: {0}")]
    InvalidStatus(String),
}

impl From<MessageBusError> for DeadLetterError {
    fn from(err: MessageBusError) -> Self {
        match err {
            MessageBusError::SerializationFailed(reason) => Self::Serialization(reason),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Lifecycle of a dead-lettered message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Waiting for investigation or replay
    #[default]
    Pending,
    /// Being replayed
    Processing,
    /// Replayed successfully
    Resolved,
    /// Given up on
    Discarded,
}

impl DeadLetterStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }
}

impl FromStr for DeadLetterStatus {
    type Err = DeadLetterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that exhausted its handling options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry id
    pub id: Uuid,
    /// Short type name of the failed message
    pub message_type: String,
    /// The original message as JSON
    pub payload: serde_json::Value,
    /// Failure kind (see `marketplace_events_core::handler::kinds`)
    pub error_kind: String,
    /// Failure description
    pub error_message: String,
    /// Handler that gave up
    pub handler_type: String,
    /// Queue the message was consumed from
    pub source_queue: String,
    /// How many times the handler ran
    pub attempt_count: u32,
    /// When the message was dead-lettered
    pub failed_at: DateTime<Utc>,
    /// Replay status
    pub status: DeadLetterStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Resolution notes
    pub resolution_notes: Option<String>,
}

impl DeadLetterEntry {
    /// New pending entry stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        message_type: impl Into<String>,
        payload: serde_json::Value,
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
        handler_type: impl Into<String>,
        source_queue: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_type: message_type.into(),
            payload,
            error_kind: error_kind.into(),
            error_message: error_message.into(),
            handler_type: handler_type.into(),
            source_queue: source_queue.into(),
            attempt_count,
            failed_at: Utc::now(),
            status: DeadLetterStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }
}

/// Future returned by [`DeadLetterSink::store`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + 'a>>;

/// Terminal destination for failed messages.
pub trait DeadLetterSink: Send + Sync {
    /// Persist or forward one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the entry could not be stored. Callers
    /// treat this as fatal.
    fn store<'a>(&'a self, entry: &'a DeadLetterEntry) -> SinkFuture<'a>;
}

impl<S: DeadLetterSink + ?Sized> DeadLetterSink for Arc<S> {
    fn store<'a>(&'a self, entry: &'a DeadLetterEntry) -> SinkFuture<'a> {
        (**self).store(entry)
    }
}

/// Bounded in-memory dead letter queue.
///
/// FIFO; when full, the oldest entry is dropped. Clones share storage.
///
/// ```
/// use marketplace_events_runtime::dead_letter::{DeadLetterEntry, InMemoryDeadLetterQueue};
///
/// let dlq = InMemoryDeadLetterQueue::new(2);
/// for n in 0..3 {
///     dlq.push(DeadLetterEntry::new("Ping", n.into(), "Io", "down", "PingHandler", "pings", 3));
/// }
/// assert_eq!(dlq.len(), 2);
/// assert_eq!(dlq.peek().unwrap().payload, 1);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryDeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetterEntry>>>,
    max_size: usize,
}

impl InMemoryDeadLetterQueue {
    /// Queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Append an entry, dropping the oldest one if the queue is full.
    pub fn push(&self, entry: DeadLetterEntry) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            DeadLetterMetrics::record_dropped();
            tracing::warn!(
                max_size = self.max_size,
                "Dead letter queue at capacity, dropping oldest entry"
            );
        }

        queue.push_back(entry);
        DeadLetterMetrics::record_queue_size(queue.len());
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest entry, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetterEntry> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Copy of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        DeadLetterMetrics::record_queue_size(0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// Capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn store<'a>(&'a self, entry: &'a DeadLetterEntry) -> SinkFuture<'a> {
        Box::pin(async move {
            self.push(entry.clone());
            Ok(())
        })
    }
}

/// Forwards dead letters to `{source_queue}{suffix}` on a message bus.
pub struct MessageBusDeadLetterSink {
    bus: Arc<dyn MessageBus>,
    suffix: String,
    source: String,
}

impl MessageBusDeadLetterSink {
    /// Sink using the default `.dead-letter` suffix.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self::with_suffix(bus, DEFAULT_DEAD_LETTER_SUFFIX)
    }

    /// Sink using a custom suffix.
    #[must_use]
    pub fn with_suffix(bus: Arc<dyn MessageBus>, suffix: impl Into<String>) -> Self {
        Self {
            bus,
            suffix: suffix.into(),
            source: "DeadLetterPolicy".to_string(),
        }
    }

    /// Destination receiving dead letters for `source_queue`.
    #[must_use]
    pub fn destination_for(&self, source_queue: &str) -> String {
        format!("{source_queue}{}", self.suffix)
    }
}

impl DeadLetterSink for MessageBusDeadLetterSink {
    fn store<'a>(&'a self, entry: &'a DeadLetterEntry) -> SinkFuture<'a> {
        Box::pin(async move {
            let destination = self.destination_for(&entry.source_queue);
            let envelope = Envelope::from_message(entry, self.source.clone())?
                .with_header("original_message_type", entry.message_type.clone())
                .with_header("error_kind", entry.error_kind.clone());

            self.bus.send(&envelope, Some(&destination)).await?;

            tracing::debug!(
                entry_id = %entry.id,
                destination = %destination,
                "Dead letter forwarded to message bus"
            );
            Ok(())
        })
    }
}
