//! Prometheus metrics for the messaging core.
//!
//! Recorder structs sit next to the log statements of each component:
//! - Retry middleware attempts, recoveries and exhaustion
//! - Dead letters stored, dropped and sink failures
//! - In-process dispatch fan-out
//! - Message bus publishes and consumption
//!
//! # Example
//!
//! ```rust,no_run
//! use marketplace_events_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Address the exporter listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether [`MetricsServer::start`] succeeded.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Register metric descriptions, install the recorder and start the HTTP
    /// listener. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a
    /// different recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = configure(PrometheusBuilder::new())
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .with_http_listener(self.addr);

        match builder.install() {
            Ok(()) => {
                register_metrics();
                self.started = true;
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }
}

/// Histogram buckets shared by every exporter.
///
/// # Errors
///
/// Returns the builder error if the bucket list is rejected.
pub fn configure(builder: PrometheusBuilder) -> Result<PrometheusBuilder, BuildError> {
    builder.set_buckets_for_metric(
        Matcher::Suffix("duration_seconds".to_string()),
        &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
    )
}

/// Register all metric descriptions with the installed recorder.
pub fn register_metrics() {
    // Retry middleware
    describe_counter!("retry_attempts_total", "Handler invocations made by the retry middleware");
    describe_counter!("retry_successes_total", "Messages handled after at least one retry");
    describe_counter!(
        "retry_exhausted_total",
        "Messages that failed permanently and were dead-lettered"
    );

    // Dead letters
    describe_counter!("dead_letters_total", "Messages stored in a dead letter sink");
    describe_counter!("dead_letter_sink_failures_total", "Dead letter sink failures");
    describe_counter!(
        "dead_letter_dropped_total",
        "Entries dropped by a full in-memory dead letter queue"
    );
    describe_gauge!("dead_letter_queue_size", "Entries held by the in-memory dead letter queue");

    // Dispatch
    describe_counter!("dispatch_events_total", "Events dispatched in-process");
    describe_counter!("dispatch_handler_failures_total", "In-process handler failures");
    describe_histogram!("dispatch_duration_seconds", "Time taken to fan an event out");

    // Message bus
    describe_counter!("message_bus_published_total", "Integration events published");
    describe_counter!("message_bus_publish_errors_total", "Publish failures");
    describe_counter!("message_bus_consumed_total", "Envelopes received by consumers");
    describe_counter!("message_bus_decode_errors_total", "Envelopes that could not be decoded");
    describe_histogram!("message_bus_publish_duration_seconds", "Time taken to publish");
}

/// Retry middleware metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a handler invocation.
    pub fn record_attempt(handler: &'static str) {
        counter!("retry_attempts_total", "handler" => handler).increment(1);
    }

    /// Record a success that needed at least one retry.
    pub fn record_success(handler: &'static str) {
        counter!("retry_successes_total", "handler" => handler).increment(1);
    }

    /// Record a permanent failure.
    pub fn record_exhausted(handler: &'static str) {
        counter!("retry_exhausted_total", "handler" => handler).increment(1);
    }
}

/// Dead letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record an entry stored by a sink.
    pub fn record_dead_lettered(error_kind: &str) {
        counter!("dead_letters_total", "error_kind" => error_kind.to_string()).increment(1);
    }

    /// Record a sink failure.
    pub fn record_sink_failure() {
        counter!("dead_letter_sink_failures_total").increment(1);
    }

    /// Record an entry dropped by a full in-memory queue.
    pub fn record_dropped() {
        counter!("dead_letter_dropped_total").increment(1);
    }

    /// Record the in-memory queue size.
    pub fn record_queue_size(size: usize) {
        // Bounded by the queue capacity; f64 is exact well beyond that.
        #[allow(clippy::cast_precision_loss)]
        gauge!("dead_letter_queue_size").set(size as f64);
    }
}

/// In-process dispatch metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record one fan-out.
    pub fn record_dispatch(handlers: usize, failures: usize, duration: Duration) {
        counter!("dispatch_events_total").increment(1);
        counter!("dispatch_handler_failures_total").increment(failures as u64);
        histogram!("dispatch_duration_seconds").record(duration.as_secs_f64());
        tracing::trace!(handlers, failures, "Dispatch recorded");
    }
}

/// Message bus metrics recorder.
pub struct MessageBusMetrics;

impl MessageBusMetrics {
    /// Record a successful publish.
    pub fn record_publish(destination: &str, duration: Duration) {
        counter!("message_bus_published_total", "destination" => destination.to_string())
            .increment(1);
        histogram!("message_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_publish_error(destination: &str) {
        counter!("message_bus_publish_errors_total", "destination" => destination.to_string())
            .increment(1);
    }

    /// Record an envelope received by a consumer.
    pub fn record_consume(destination: &str) {
        counter!("message_bus_consumed_total", "destination" => destination.to_string())
            .increment(1);
    }

    /// Record an envelope that could not be decoded.
    pub fn record_decode_error(destination: &str) {
        counter!("message_bus_decode_errors_total", "destination" => destination.to_string())
            .increment(1);
    }
}
