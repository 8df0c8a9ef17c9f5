//! Marketplace messaging worker.
//!
//! Connects to the transport chosen for `MARKETPLACE_ENVIRONMENT`, exposes Prometheus
//! metrics and runs an audit consumer on every routed destination. Failed
//! deliveries follow the configured retry policy into the dead letter sink.
//!
//! ```bash
//! MARKETPLACE_ENVIRONMENT=development REDIS_URL=redis://127.0.0.1:6379 \
//!     cargo run -p marketplace-messaging
//! ```

use anyhow::Context;
use marketplace_events_core::handler::handler_fn;
use marketplace_events_runtime::metrics::MetricsServer;
use marketplace_events_runtime::{ConsumerHandle, MessageConsumer};
use marketplace_messaging::{MessageBusFactory, MessagingConfig};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketplace=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MessagingConfig::from_env().context("Invalid messaging configuration")?;
    tracing::info!(
        environment = %config.environment,
        strategy = ?config.routing.strategy,
        default_destination = %config.routing.default_destination,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(SocketAddr::from(([0, 0, 0, 0], config.metrics_port)));
    metrics.start().context("Failed to start metrics server")?;

    let factory = MessageBusFactory::new(config);
    let bus = factory.create_message_bus().await?;
    let sink = factory.create_dead_letter_sink(bus.clone()).await?;

    let cancel = CancellationToken::new();
    let consumer = MessageConsumer::new(bus, factory.retry_middleware(sink))
        .with_cancellation(cancel.clone());

    let mut handles: Vec<(String, ConsumerHandle)> = Vec::new();
    for destination in factory.config().destinations() {
        let audit = handler_fn("audit", |message: serde_json::Value, _cancel| async move {
            tracing::debug!(payload = %message, "Message received");
            Ok(())
        });
        let handle = consumer
            .spawn(Some(&destination), audit)
            .await
            .with_context(|| format!("Failed to subscribe to '{destination}'"))?;
        handles.push((destination, handle));
    }
    tracing::info!(consumers = handles.len(), "Worker running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down");
    cancel.cancel();

    for (destination, handle) in handles {
        match handle.await {
            Ok(Ok(stats)) => tracing::info!(
                destination = %destination,
                received = stats.received,
                delivered = stats.delivered,
                dead_lettered = stats.dead_lettered,
                "Consumer stopped"
            ),
            Ok(Err(e)) => {
                tracing::error!(destination = %destination, error = %e, "Consumer failed");
            },
            Err(e) => {
                tracing::error!(destination = %destination, error = %e, "Consumer task panicked");
            },
        }
    }

    Ok(())
}
