//! Message bus factory.
//!
//! Picks the transport from the configured [`HostEnvironment`]:
//!
//! | environment   | transport                |
//! |---------------|--------------------------|
//! | `testing`     | in-memory                |
//! | `development` | Redis                    |
//! | anything else | Redpanda (Kafka protocol)|
//!
//! The factory holds configuration only; every call builds a fresh bus.

use crate::config::{HostEnvironment, MessagingConfig};
use marketplace_events_core::message_bus::{MessageBus, MessageBusError};
use marketplace_events_core::routing::{RoutingTable, TopicSelector};
use marketplace_events_postgres::PostgresDeadLetterStore;
use marketplace_events_redis::RedisMessageBus;
use marketplace_events_redpanda::RedpandaMessageBus;
use marketplace_events_runtime::dead_letter::{
    DeadLetterError, DeadLetterSink, InMemoryDeadLetterQueue, MessageBusDeadLetterSink,
};
use marketplace_events_runtime::policy::DeadLetterService;
use marketplace_events_runtime::retry::RetryMiddleware;
use marketplace_events_testing::InMemoryMessageBus;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while wiring messaging components.
#[derive(Error, Debug)]
pub enum FactoryError {
    /// The broker could not be reached or configured.
    #[error("Failed to create message bus: {0}")]
    Transport(#[from] MessageBusError),

    /// The durable dead letter store could not be opened.
    #[error("Failed to create dead letter store: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

/// Concrete transport behind a [`MessageBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Process-local bus
    InMemory,
    /// Redis (development broker)
    Redis,
    /// Redpanda (production broker)
    Redpanda,
}

impl TransportKind {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InMemory => "in-memory",
            Self::Redis => "redis",
            Self::Redpanda => "redpanda",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport for `environment`.
///
/// ```
/// use marketplace_messaging::{HostEnvironment, TransportKind, select_transport};
///
/// assert_eq!(select_transport(&HostEnvironment::Testing), TransportKind::InMemory);
/// assert_eq!(select_transport(&HostEnvironment::Development), TransportKind::Redis);
/// assert_eq!(select_transport(&"qa-eu".parse().unwrap()), TransportKind::Redpanda);
/// ```
#[must_use]
pub const fn select_transport(environment: &HostEnvironment) -> TransportKind {
    match environment {
        HostEnvironment::Testing => TransportKind::InMemory,
        HostEnvironment::Development => TransportKind::Redis,
        HostEnvironment::Staging | HostEnvironment::Production | HostEnvironment::Other(_) => {
            TransportKind::Redpanda
        },
    }
}

/// Builds the messaging components described by a [`MessagingConfig`].
#[derive(Debug, Clone)]
pub struct MessageBusFactory {
    config: MessagingConfig,
}

impl MessageBusFactory {
    /// Factory over `config`.
    #[must_use]
    pub const fn new(config: MessagingConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Transport [`MessageBusFactory::create_message_bus`] will build.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        select_transport(&self.config.environment)
    }

    /// Build the message bus for the configured environment.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::Transport`] if the broker client cannot be
    /// created.
    pub async fn create_message_bus(&self) -> Result<Arc<dyn MessageBus>, FactoryError> {
        let transport = self.transport();
        let default_destination = self.config.routing.default_destination.clone();

        let bus: Arc<dyn MessageBus> = match transport {
            TransportKind::InMemory => Arc::new(InMemoryMessageBus::new(default_destination)),
            TransportKind::Redis => {
                Arc::new(RedisMessageBus::new(&self.config.redis.url, default_destination).await?)
            },
            TransportKind::Redpanda => {
                let mut builder = RedpandaMessageBus::builder()
                    .brokers(&self.config.redpanda.brokers)
                    .default_destination(default_destination);
                if let Some(group) = &self.config.redpanda.consumer_group {
                    builder = builder.consumer_group(group);
                }
                Arc::new(builder.build()?)
            },
        };

        tracing::info!(
            environment = %self.config.environment,
            transport = %transport,
            default_destination = bus.default_destination(),
            "Message bus created"
        );
        Ok(bus)
    }

    /// Routing for integration events. Dedicated destinations are registered
    /// by the caller in `table`.
    #[must_use]
    pub fn topic_selector(&self, table: RoutingTable) -> TopicSelector {
        TopicSelector::new(self.config.routing.clone(), table)
    }

    /// Dead letter sink for the configured environment.
    ///
    /// - `DATABASE_URL` set: durable `PostgreSQL` store (schema applied)
    /// - testing: bounded in-memory queue
    /// - otherwise: `{queue}{suffix}` on `bus`
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::DeadLetter`] if the database is unreachable.
    pub async fn create_dead_letter_sink(
        &self,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Arc<dyn DeadLetterSink>, FactoryError> {
        if let Some(url) = &self.config.database_url {
            let store = PostgresDeadLetterStore::connect(url).await?;
            store.ensure_schema().await?;
            tracing::info!("Dead letters go to PostgreSQL");
            return Ok(Arc::new(store));
        }

        if self.transport() == TransportKind::InMemory {
            return Ok(Arc::new(InMemoryDeadLetterQueue::default()));
        }

        tracing::info!(
            suffix = %self.config.dead_letter_suffix,
            "Dead letters go to the message bus"
        );
        Ok(Arc::new(MessageBusDeadLetterSink::with_suffix(
            bus,
            self.config.dead_letter_suffix.clone(),
        )))
    }

    /// Retry middleware applying the configured policy over `sink`.
    #[must_use]
    pub fn retry_middleware(&self, sink: Arc<dyn DeadLetterSink>) -> RetryMiddleware {
        RetryMiddleware::new(Arc::new(DeadLetterService::new(self.config.retry.clone(), sink)))
    }
}
