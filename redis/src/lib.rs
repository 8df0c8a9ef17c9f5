//! Redis message bus for the marketplace messaging core.
//!
//! Development broker. Implements [`MessageBus`] on plain Redis primitives:
//!
//! - **publish** → `PUBLISH {destination}`: every live subscription receives a
//!   copy; nothing is kept for absent subscribers
//! - **send** → `RPUSH queue:{destination}`: the message waits in a list
//!   until exactly one consumer pops it with `BLPOP`
//! - **subscribe** → both of the above for one destination, merged into a
//!   single stream
//!
//! Envelopes are framed with [`Envelope::to_bytes`].
//!
//! Queued envelopes are popped one at a time, only when the subscriber has
//! taken the previous one. A popped envelope whose subscriber has already
//! gone is pushed back to the head of the list. The envelope a subscriber
//! holds when it drops its stream, plus at most one buffered behind it, is
//! lost: this broker is for development only.
//!
//! # Example
//!
//! ```no_run
//! use marketplace_events_core::message_bus::{Envelope, MessageBus};
//! use marketplace_events_redis::RedisMessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedisMessageBus::new("redis://127.0.0.1:6379", "marketplace-events").await?;
//!
//! let envelope = Envelope::from_message(&"payout requested", "Payments")?;
//! bus.send(&envelope, Some("payouts")).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use marketplace_events_core::message_bus::{
    BusFuture, Envelope, EnvelopeStream, MessageBus, MessageBusError,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::mpsc;

/// Prefix of the lists backing point-to-point queues.
pub const QUEUE_KEY_PREFIX: &str = "queue:";

/// Default channel capacity between Redis and a subscriber.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Seconds a `BLPOP` waits before checking whether the subscriber is gone.
const BLPOP_TIMEOUT_SECS: f64 = 1.0;

/// Pause after a failed `BLPOP` before trying again.
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Popped queue envelopes buffered per subscription.
const QUEUE_BUFFER_SIZE: usize = 1;

type Sender = mpsc::Sender<Result<Envelope, MessageBusError>>;

/// Redis message bus.
///
/// Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct RedisMessageBus {
    client: Client,
    conn: ConnectionManager,
    default_destination: String,
    buffer_size: usize,
}

impl RedisMessageBus {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::ConnectionFailed`] if the URL is invalid or
    /// Redis is unreachable.
    pub async fn new(
        redis_url: &str,
        default_destination: impl Into<String>,
    ) -> Result<Self, MessageBusError> {
        let client = Client::open(redis_url).map_err(|e| {
            MessageBusError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            MessageBusError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        let default_destination = default_destination.into();
        tracing::info!(default_destination = %default_destination, "RedisMessageBus connected");

        Ok(Self {
            client,
            conn,
            default_destination,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    /// Published envelopes buffered per subscription. Zero is raised to one.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Redis key of the list backing queue `destination`.
    #[must_use]
    pub fn queue_key(destination: &str) -> String {
        format!("{QUEUE_KEY_PREFIX}{destination}")
    }

    /// Messages waiting in queue `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::TransportError`] if Redis fails.
    pub async fn queue_len(&self, destination: &str) -> Result<usize, MessageBusError> {
        let mut conn = self.conn.clone();
        conn.llen(Self::queue_key(destination))
            .await
            .map_err(|e| MessageBusError::TransportError(e.to_string()))
    }
}

impl MessageBus for RedisMessageBus {
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let destination = self.resolve(destination);
            let failed = |reason: String| MessageBusError::SendFailed {
                destination: destination.to_string(),
                reason,
            };

            let payload = envelope.to_bytes().map_err(|e| failed(e.to_string()))?;
            let mut conn = self.conn.clone();
            let depth: i64 = conn
                .rpush(Self::queue_key(destination), payload)
                .await
                .map_err(|e| failed(e.to_string()))?;

            tracing::debug!(
                destination,
                message_id = %envelope.message_id,
                message_type = %envelope.message_type,
                depth,
                "Envelope queued"
            );
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let destination = self.resolve(destination);
            let failed = |reason: String| MessageBusError::PublishFailed {
                destination: destination.to_string(),
                reason,
            };

            let payload = envelope.to_bytes().map_err(|e| failed(e.to_string()))?;
            let mut conn = self.conn.clone();
            let receivers: i64 = conn
                .publish(destination, payload)
                .await
                .map_err(|e| failed(e.to_string()))?;

            tracing::debug!(
                destination,
                message_id = %envelope.message_id,
                message_type = %envelope.message_type,
                receivers,
                "Envelope published"
            );
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, subscription: Option<&'a str>) -> BusFuture<'a, EnvelopeStream> {
        Box::pin(async move {
            let destination = self.resolve(subscription).to_string();
            let subscription_failed = |reason: String| MessageBusError::SubscriptionFailed {
                subscription: destination.clone(),
                reason,
            };

            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| {
                    subscription_failed(format!("Failed to open pub/sub connection: {e}"))
                })?;
            pubsub
                .subscribe(&destination)
                .await
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            let queue_conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| subscription_failed(format!("Failed to open queue connection: {e}")))?;

            let (published_tx, mut published) = mpsc::channel(self.buffer_size);
            let (queued_tx, mut queued) = mpsc::channel(QUEUE_BUFFER_SIZE);

            tokio::spawn(forward_published(pubsub, published_tx, destination.clone()));
            tokio::spawn(forward_queued(queue_conn, queued_tx, destination.clone()));

            tracing::info!(destination = %destination, "Subscribed to Redis destination");

            let stream: EnvelopeStream = Box::pin(async_stream::stream! {
                loop {
                    let item = tokio::select! {
                        Some(item) = published.recv() => item,
                        Some(item) = queued.recv() => item,
                        else => break,
                    };
                    yield item;
                }
            });
            Ok(stream)
        })
    }

    fn default_destination(&self) -> &str {
        &self.default_destination
    }
}

/// Pump `PUBLISH`ed envelopes into the subscriber channel.
async fn forward_published(pubsub: redis::aio::PubSub, tx: Sender, channel: String) {
    let mut messages = pubsub.into_on_message();

    loop {
        let message = tokio::select! {
            () = tx.closed() => break,
            message = messages.next() => message,
        };
        let Some(message) = message else {
            let _ = tx
                .send(Err(MessageBusError::TransportError(format!(
                    "Pub/sub connection for '{channel}' closed"
                ))))
                .await;
            break;
        };

        if tx.send(Envelope::from_bytes(message.get_payload_bytes())).await.is_err() {
            break;
        }
    }

    tracing::debug!(channel = %channel, "Pub/sub forwarder exiting");
}

/// Pop queued envelopes into the subscriber channel, one at a time.
///
/// A slot is reserved before each `BLPOP`, so nothing leaves Redis until the
/// subscriber has room for it.
async fn forward_queued(
    mut conn: redis::aio::MultiplexedConnection,
    tx: Sender,
    destination: String,
) {
    let key = RedisMessageBus::queue_key(&destination);

    while let Ok(permit) = tx.reserve().await {
        let popped: Result<Option<(String, Vec<u8>)>, _> =
            conn.blpop(&key, BLPOP_TIMEOUT_SECS).await;

        match popped {
            Ok(Some((_, payload))) => {
                if tx.is_closed() {
                    requeue(&mut conn, &key, payload, &destination).await;
                    break;
                }
                permit.send(Envelope::from_bytes(&payload));
            },
            Ok(None) => {},
            Err(e) => {
                tracing::warn!(destination = %destination, error = %e, "BLPOP failed");
                permit.send(Err(MessageBusError::TransportError(e.to_string())));
                tokio::time::sleep(QUEUE_RETRY_DELAY).await;
            },
        }
    }

    tracing::debug!(destination = %destination, "Queue forwarder exiting");
}

/// Put a popped payload back at the head of its queue.
async fn requeue(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    payload: Vec<u8>,
    destination: &str,
) {
    let pushed: redis::RedisResult<i64> = conn.lpush(key, payload).await;
    match pushed {
        Ok(_) => tracing::debug!(destination, "Subscriber gone, popped envelope requeued"),
        Err(e) => tracing::error!(
            destination,
            error = %e,
            "Subscriber gone and requeue failed, envelope lost"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_message_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedisMessageBus>();
        assert_sync::<RedisMessageBus>();
    }

    #[test]
    fn queue_keys_are_prefixed() {
        assert_eq!(RedisMessageBus::queue_key("payouts"), "queue:payouts");
        assert_eq!(
            RedisMessageBus::queue_key("users-events.dead-letter"),
            "queue:users-events.dead-letter"
        );
    }

    #[tokio::test]
    async fn invalid_url_fails_to_connect() {
        let result = RedisMessageBus::new("not-a-url", "marketplace-events").await;
        assert!(matches!(result, Err(MessageBusError::ConnectionFailed(_))));
    }
}
