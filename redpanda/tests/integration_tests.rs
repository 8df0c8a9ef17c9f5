//! Integration tests for [`RedpandaMessageBus`] against a real Kafka broker.
//!
//! These tests are marked `#[ignore]` because they need Docker
//! (testcontainers) and take 15-60 seconds each to start Kafka.
//!
//! To run explicitly:
//! ```bash
//! cargo test -p marketplace-events-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use marketplace_events_core::message_bus::{Envelope, EnvelopeStream, MessageBus};
use marketplace_events_redpanda::RedpandaMessageBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn envelope(body: &str) -> Envelope {
    Envelope::from_message(&body.to_string(), "Tests").expect("message should serialize")
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn bus(brokers: &str, group: &str) -> RedpandaMessageBus {
    RedpandaMessageBus::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create message bus")
}

/// Publish a warmup envelope until the topic exists and metadata propagated.
async fn ensure_topic_exists(bus: &RedpandaMessageBus, topic: &str) {
    for attempt in 1..=60 {
        if bus.publish(&envelope("warmup"), Some(topic)).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

async fn receive(stream: &mut EnvelopeStream, count: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), async {
        while bodies.len() < count {
            let Some(item) = stream.next().await else { break };
            let body: String = item
                .expect("Failed to receive envelope")
                .decode()
                .expect("payload should decode");
            if body != "warmup" {
                bodies.push(body);
            }
        }
    })
    .await
    .expect("Timeout waiting for envelopes");
    bodies
}

#[tokio::test]
#[ignore]
async fn publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "round-trip");
    ensure_topic_exists(&bus, "users-events").await;

    let mut stream = bus
        .subscribe(Some("users-events"))
        .await
        .expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let first = envelope("first").with_header("correlation_id", "c-1");
    bus.publish(&first, Some("users-events"))
        .await
        .expect("Failed to publish");
    bus.publish(&envelope("second"), Some("users-events"))
        .await
        .expect("Failed to publish");

    assert_eq!(receive(&mut stream, 2).await, vec!["first", "second"]);
}

#[tokio::test]
#[ignore]
async fn separate_groups_each_receive_published_messages() {
    let (_kafka, brokers) = start_kafka().await;
    let notifications = bus(&brokers, "notifications");
    let search = bus(&brokers, "search");
    ensure_topic_exists(&notifications, "jobs-events").await;

    let mut first = notifications.subscribe(Some("jobs-events")).await.expect("subscribe");
    let mut second = search.subscribe(Some("jobs-events")).await.expect("subscribe");
    tokio::time::sleep(Duration::from_secs(3)).await;

    notifications
        .publish(&envelope("job-posted"), Some("jobs-events"))
        .await
        .expect("Failed to publish");

    assert_eq!(receive(&mut first, 1).await, vec!["job-posted"]);
    assert_eq!(receive(&mut second, 1).await, vec!["job-posted"]);
}

#[tokio::test]
#[ignore]
async fn send_to_default_destination() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaMessageBus::builder()
        .brokers(&brokers)
        .default_destination("payouts")
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create message bus");
    ensure_topic_exists(&bus, "payouts").await;

    let mut stream = bus.subscribe(None).await.expect("Failed to subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    bus.send(&envelope("payout-requested"), None)
        .await
        .expect("Failed to send");

    assert_eq!(receive(&mut stream, 1).await, vec!["payout-requested"]);
}

#[tokio::test]
#[ignore]
async fn envelope_in_hand_is_redelivered_after_subscriber_drops() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = bus(&brokers, "payouts-worker");
    ensure_topic_exists(&bus, "payouts-events").await;

    let mut stream = bus.subscribe(Some("payouts-events")).await.expect("subscribe");
    tokio::time::sleep(Duration::from_secs(2)).await;

    bus.publish(&envelope("handled"), Some("payouts-events"))
        .await
        .expect("Failed to publish");
    bus.publish(&envelope("in-hand"), Some("payouts-events"))
        .await
        .expect("Failed to publish");

    // Polling for "in-hand" commits "handled"; "in-hand" itself is never finished.
    assert_eq!(receive(&mut stream, 2).await, vec!["handled", "in-hand"]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(stream);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut again = bus.subscribe(Some("payouts-events")).await.expect("subscribe");
    assert_eq!(receive(&mut again, 1).await, vec!["in-hand"]);
}
