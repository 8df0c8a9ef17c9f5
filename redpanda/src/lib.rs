//! Redpanda message bus for the marketplace messaging core.
//!
//! Implements [`MessageBus`] over the Kafka protocol with rdkafka. Works
//! against Redpanda or any Kafka-compatible broker.
//!
//! # Destinations
//!
//! Every destination is a Kafka topic. The difference between the two send
//! modes lies in partitioning and consumer groups:
//!
//! - **publish**: keyed by message type, so messages of one type keep their
//!   order. Each service subscribes with its own consumer group and gets its
//!   own copy.
//! - **send**: keyed by message id, spreading messages over partitions.
//!   Instances of a service share a consumer group, so each message is
//!   handled once.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An envelope's offset is committed when the subscriber polls the stream
//!   again, i.e. once it is done with that envelope
//! - Envelopes still buffered, or in hand, when the stream is dropped or the
//!   process dies are redelivered to the group
//! - Consumers MUST be idempotent (use [`Envelope::message_id`])
//!
//! # Example
//!
//! ```no_run
//! use marketplace_events_core::message_bus::{Envelope, MessageBus};
//! use marketplace_events_redpanda::RedpandaMessageBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .default_destination("marketplace-events")
//!     .consumer_group("notifications")
//!     .build()?;
//!
//! let mut stream = bus.subscribe(Some("users-events")).await?;
//!
//! let envelope = Envelope::from_message(&"hello", "Users")?;
//! bus.publish(&envelope, Some("users-events")).await?;
//!
//! while let Some(result) = stream.next().await {
//!     println!("Received: {}", result?);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use marketplace_events_core::message_bus::{
    BusFuture, Envelope, EnvelopeStream, MessageBus, MessageBusError,
};
use marketplace_events_core::routing::DEFAULT_DESTINATION;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;

/// Default channel capacity between the Kafka consumer and a subscriber.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Prefix of consumer groups derived from the destination.
pub const CONSUMER_GROUP_PREFIX: &str = "marketplace";

/// Producer send timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a consumed record lives, for committing once it is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

type Delivery = (Result<Envelope, MessageBusError>, Option<Position>);

/// Which [`MessageBus`] operation produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Send,
    Publish,
}

/// Redpanda message bus.
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Default destination**: topic used when none is given
/// - **Producer settings**: acks, compression, timeout
/// - **Consumer group**: explicit id, or `marketplace-{destination}`
/// - **Buffer size**: envelopes buffered per subscription (default: 1000)
/// - **Offset reset**: where new groups start reading (default: "latest")
pub struct RedpandaMessageBus {
    producer: FutureProducer,
    brokers: String,
    default_destination: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaMessageBus {
    /// Bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, MessageBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Builder for a configured bus.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used when subscribing to `destination`.
    #[must_use]
    pub fn consumer_group_for(&self, destination: &str) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| format!("{CONSUMER_GROUP_PREFIX}-{destination}"))
    }

    async fn produce(
        &self,
        envelope: &Envelope,
        destination: &str,
        mode: Mode,
    ) -> Result<(), MessageBusError> {
        let failed = |reason: String| match mode {
            Mode::Send => MessageBusError::SendFailed {
                destination: destination.to_string(),
                reason,
            },
            Mode::Publish => MessageBusError::PublishFailed {
                destination: destination.to_string(),
                reason,
            },
        };

        let payload = envelope
            .to_bytes()
            .map_err(|e| failed(format!("Failed to frame envelope: {e}")))?;

        let message_id = envelope.message_id.to_string();
        let key = match mode {
            Mode::Publish => envelope.message_type.as_str(),
            Mode::Send => message_id.as_str(),
        };

        let record = FutureRecord::to(destination).payload(&payload).key(key);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    destination,
                    partition,
                    offset,
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    mode = ?mode,
                    "Envelope produced"
                );
                Ok(())
            },
            Err((kafka_error, _)) => {
                tracing::error!(
                    destination,
                    message_id = %envelope.message_id,
                    error = %kafka_error,
                    "Failed to produce envelope"
                );
                Err(failed(kafka_error.to_string()))
            },
        }
    }
}

/// Builder for a [`RedpandaMessageBus`].
#[derive(Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    default_destination: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaMessageBusBuilder {
    /// Comma-separated broker addresses, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic used when an operation names no destination.
    ///
    /// Default: `marketplace-events`
    #[must_use]
    pub fn default_destination(mut self, destination: impl Into<String>) -> Self {
        self.default_destination = Some(destination.into());
        self
    }

    /// Producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group for every subscription of this bus.
    ///
    /// Instances sharing a group split the messages of a destination; give
    /// each service its own group to receive its own copy of published
    /// messages.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Envelopes buffered between the Kafka consumer and a subscriber.
    /// Zero is raised to one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where new consumer groups start reading: "earliest" or "latest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::ConnectionFailed`] if no brokers are set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaMessageBus, MessageBusError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| {
                MessageBusError::ConnectionFailed("Brokers not configured".to_string())
            })?;

        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let producer: FutureProducer = producer_config(&brokers, acks, compression, timeout)
            .create()
            .map_err(|e| {
                MessageBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let default_destination = self
            .default_destination
            .unwrap_or_else(|| DEFAULT_DESTINATION.to_string());
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "latest".to_string());

        tracing::info!(
            brokers = %brokers,
            default_destination = %default_destination,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaMessageBus created"
        );

        Ok(RedpandaMessageBus {
            producer,
            brokers,
            default_destination,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl MessageBus for RedpandaMessageBus {
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move { self.produce(envelope, self.resolve(destination), Mode::Send).await })
    }

    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            self.produce(envelope, self.resolve(destination), Mode::Publish)
                .await
        })
    }

    fn subscribe<'a>(&'a self, subscription: Option<&'a str>) -> BusFuture<'a, EnvelopeStream> {
        let topic = self.resolve(subscription).to_string();
        let group_id = self.consumer_group_for(&topic);
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let subscription_failed = |reason: String| MessageBusError::SubscriptionFailed {
                subscription: topic.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                topic = %topic,
                consumer_group = %group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topic"
            );

            let consumer = Arc::new(consumer);
            let (tx, mut rx) = tokio::sync::mpsc::channel::<Delivery>(buffer_size);

            let reader = Arc::clone(&consumer);
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = reader.stream();

                loop {
                    // Leave the group as soon as the subscriber is gone so its
                    // uncommitted offsets go to another member.
                    let next = tokio::select! {
                        () = tx.closed() => break,
                        next = stream.next() => next,
                    };
                    let Some(next) = next else { break };

                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            let err = MessageBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send((Err(err), None)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let item = match message.payload() {
                        Some(payload) => Envelope::from_bytes(payload),
                        None => Err(MessageBusError::DeserializationFailed(
                            "Message has no payload".to_string(),
                        )),
                    };

                    if let Ok(envelope) = &item {
                        tracing::trace!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            message_type = %envelope.message_type,
                            "Received envelope"
                        );
                    }

                    let position = Position {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                    };
                    if tx.send((item, Some(position))).await.is_err() {
                        tracing::debug!("Subscriber dropped, exiting consumer task");
                        break;
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream: EnvelopeStream = Box::pin(async_stream::stream! {
                while let Some((item, position)) = rx.recv().await {
                    yield item;
                    // Polled again: the subscriber is done with `item`.
                    if let Some(position) = position {
                        commit(&consumer, &position);
                    }
                }
            });
            Ok(stream)
        })
    }

    fn default_destination(&self) -> &str {
        &self.default_destination
    }
}

/// Producer settings; `message.timeout.ms` follows the send timeout.
fn producer_config(
    brokers: &str,
    acks: &str,
    compression: &str,
    timeout: Duration,
) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", timeout.as_millis().to_string())
        .set("acks", acks)
        .set("compression.type", compression);
    config
}

/// Commit the offset after `position`. Failures only mean redelivery.
fn commit(consumer: &StreamConsumer, position: &Position) {
    let mut offsets = TopicPartitionList::new();
    let result = offsets
        .add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset.saturating_add(1)),
        )
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

    if let Err(e) = result {
        tracing::warn!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}
