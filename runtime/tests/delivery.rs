//! End-to-end delivery over the in-memory bus: routed publishing, consumers,
//! retry and dead-lettering.

// Test code can use unwrap/expect/panic
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use marketplace_events_core::event::DomainEvent;
use marketplace_events_core::handler::{HandlerError, handler_fn, kinds};
use marketplace_events_core::message_bus::{Envelope, MessageBus};
use marketplace_events_core::routing::{RoutingOptions, RoutingTable, TopicSelector, TopicStrategy};
use marketplace_events_runtime::prelude::*;
use marketplace_events_runtime::{ConsumerStats, DeadLetterEntry, MessageBusDeadLetterSink};
use marketplace_events_testing::fixtures::modules::jobs::{JobCancelled, JobCreated, JobPosted};
use marketplace_events_testing::fixtures::modules::users::UserRegistered;
use marketplace_events_testing::fixtures::shared::Heartbeat;
use marketplace_events_testing::{InMemoryMessageBus, RecordingHandler, ScriptedHandler};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Test Fixtures
// ============================================================================

fn domain_selector() -> Arc<TopicSelector> {
    let mut table = RoutingTable::new();
    table.dedicated::<Heartbeat>("platform-heartbeats");

    Arc::new(TopicSelector::new(
        RoutingOptions {
            strategy: TopicStrategy::MultipleByDomain,
            default_destination: "marketplace-events".to_string(),
            domain_destinations: BTreeMap::from([
                ("Users".to_string(), "users-events".to_string()),
                ("jobs".to_string(), "jobs-events".to_string()),
            ]),
        },
        table,
    ))
}

fn fast_policy(max_attempts: u32) -> DeadLetterPolicyOptions {
    DeadLetterPolicyOptions::builder()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

fn middleware(
    options: DeadLetterPolicyOptions,
    sink: Arc<dyn marketplace_events_runtime::DeadLetterSink>,
) -> RetryMiddleware {
    RetryMiddleware::new(Arc::new(DeadLetterService::new(options, sink)))
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn stop(
    cancel: &CancellationToken,
    handle: marketplace_events_runtime::ConsumerHandle,
) -> ConsumerStats {
    cancel.cancel();
    handle.await.expect("consumer task panicked").expect("consumer failed")
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn publisher_routes_by_owning_module() {
    let bus = InMemoryMessageBus::new("marketplace-events");
    let publisher = IntegrationEventPublisher::new(Arc::new(bus.clone()), domain_selector());

    publisher.publish(&UserRegistered::new("ana@example.com")).await.unwrap();
    publisher.publish(&JobPosted::new(Uuid::now_v7(), "Fix sink")).await.unwrap();
    publisher.publish(&Heartbeat::new("worker-1")).await.unwrap();

    assert_eq!(bus.published_to("users-events").len(), 1);
    assert_eq!(bus.published_to("jobs-events").len(), 1);
    assert_eq!(bus.published_to("platform-heartbeats").len(), 1);
    assert!(bus.published_to("marketplace-events").is_empty());
}

#[tokio::test]
async fn single_strategy_sends_everything_to_default() {
    let bus = InMemoryMessageBus::new("marketplace-events");
    let publisher =
        IntegrationEventPublisher::new(Arc::new(bus.clone()), Arc::new(TopicSelector::default()));

    publisher.publish(&UserRegistered::new("ana@example.com")).await.unwrap();
    publisher.publish(&JobPosted::new(Uuid::now_v7(), "Fix sink")).await.unwrap();

    assert_eq!(bus.published_to("marketplace-events").len(), 2);
}

#[tokio::test]
async fn publish_failure_is_returned_to_caller() {
    let bus = InMemoryMessageBus::default();
    bus.set_failing(true);
    let publisher = IntegrationEventPublisher::new(Arc::new(bus), domain_selector());

    let result = publisher.publish(&UserRegistered::new("ana@example.com")).await;

    assert!(result.is_err());
}

// ============================================================================
// Consuming
// ============================================================================

#[tokio::test]
async fn consumer_delivers_published_events() {
    let bus = Arc::new(InMemoryMessageBus::new("marketplace-events"));
    let dlq = InMemoryDeadLetterQueue::new(10);
    let cancel = CancellationToken::new();
    let consumer =
        MessageConsumer::new(bus.clone(), middleware(fast_policy(3), Arc::new(dlq.clone())))
            .with_cancellation(cancel.clone());

    let recorder = RecordingHandler::<UserRegistered>::new("WelcomeEmail");
    let handle = consumer.spawn(Some("users-events"), recorder.clone()).await.unwrap();

    let publisher = IntegrationEventPublisher::new(bus.clone(), domain_selector());
    let event = UserRegistered::new("ana@example.com");
    publisher.publish(&event).await.unwrap();

    wait_until(|| recorder.count() == 1).await;
    let stats = stop(&cancel, handle).await;

    assert_eq!(recorder.received(), vec![event]);
    assert_eq!(stats.delivered, 1);
    assert!(dlq.is_empty());
}

#[tokio::test]
async fn consumer_dead_letters_undecodable_envelopes() {
    let bus = Arc::new(InMemoryMessageBus::default());
    let dlq = InMemoryDeadLetterQueue::new(10);
    let cancel = CancellationToken::new();
    let consumer =
        MessageConsumer::new(bus.clone(), middleware(fast_policy(3), Arc::new(dlq.clone())))
            .with_cancellation(cancel.clone());

    let recorder = RecordingHandler::<UserRegistered>::new("WelcomeEmail");
    let handle = consumer.spawn(Some("users-events"), recorder.clone()).await.unwrap();

    let garbage = Envelope::from_message(&"not a user", "Tests").unwrap();
    bus.publish(&garbage, Some("users-events")).await.unwrap();

    wait_until(|| dlq.len() == 1).await;
    let stats = stop(&cancel, handle).await;

    let entry = dlq.peek().unwrap();
    assert_eq!(entry.error_kind, kinds::SERIALIZATION);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.source_queue, "users-events");
    assert_eq!(entry.handler_type, "WelcomeEmail");
    assert_eq!(entry.payload, serde_json::json!("not a user"));
    assert_eq!(recorder.count(), 0);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn consumer_retries_transient_failures() {
    let bus = Arc::new(InMemoryMessageBus::default());
    let dlq = InMemoryDeadLetterQueue::new(10);
    let cancel = CancellationToken::new();
    let consumer =
        MessageConsumer::new(bus.clone(), middleware(fast_policy(3), Arc::new(dlq.clone())))
            .with_cancellation(cancel.clone());

    let flaky = ScriptedHandler::new(
        "SyncCrm",
        [Err(HandlerError::timeout("crm slow")), Err(HandlerError::io("reset"))],
    );
    let handle = consumer
        .spawn::<UserRegistered, _>(Some("users-events"), flaky.clone())
        .await
        .unwrap();

    let registered = Envelope::from_event(&UserRegistered::new("ana@example.com")).unwrap();
    bus.send(&registered, Some("users-events"))
        .await
        .unwrap();

    wait_until(|| flaky.invocations() == 3).await;
    let stats = stop(&cancel, handle).await;

    assert_eq!(stats.delivered, 1);
    assert!(dlq.is_empty());
}

#[tokio::test]
async fn exhausted_messages_are_forwarded_to_dead_letter_destination() {
    let bus = Arc::new(InMemoryMessageBus::default());
    let sink = MessageBusDeadLetterSink::new(bus.clone());
    let cancel = CancellationToken::new();
    let consumer = MessageConsumer::new(bus.clone(), middleware(fast_policy(2), Arc::new(sink)))
        .with_cancellation(cancel.clone());

    let broken =
        ScriptedHandler::always_failing("SyncCrm", HandlerError::broker("crm unavailable"));
    let handle = consumer
        .spawn::<UserRegistered, _>(Some("users-events"), broken.clone())
        .await
        .unwrap();

    let registered = Envelope::from_event(&UserRegistered::new("ana@example.com")).unwrap();
    bus.send(&registered, Some("users-events"))
        .await
        .unwrap();

    wait_until(|| !bus.sent_to("users-events.dead-letter").is_empty()).await;
    let stats = stop(&cancel, handle).await;

    let forwarded = bus.sent_to("users-events.dead-letter");
    let entry: DeadLetterEntry = forwarded[0].decode().unwrap();
    assert_eq!(forwarded[0].header("original_message_type"), Some("UserRegistered"));
    assert_eq!(forwarded[0].header("error_kind"), Some(kinds::BROKER));
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.handler_type, "SyncCrm");
    assert_eq!(broken.invocations(), 2);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn non_retryable_failure_is_dead_lettered_after_one_attempt() {
    let bus = Arc::new(InMemoryMessageBus::default());
    let dlq = InMemoryDeadLetterQueue::new(10);
    let cancel = CancellationToken::new();
    let consumer =
        MessageConsumer::new(bus.clone(), middleware(fast_policy(5), Arc::new(dlq.clone())))
            .with_cancellation(cancel.clone());

    let strict =
        ScriptedHandler::always_failing("CheckEmail", HandlerError::validation("bad address"));
    let handle = consumer
        .spawn::<UserRegistered, _>(Some("users-events"), strict.clone())
        .await
        .unwrap();

    bus.send(&Envelope::from_event(&UserRegistered::new("nope")).unwrap(), Some("users-events"))
        .await
        .unwrap();

    wait_until(|| dlq.len() == 1).await;
    stop(&cancel, handle).await;

    assert_eq!(strict.invocations(), 1);
    assert_eq!(dlq.peek().unwrap().error_kind, kinds::VALIDATION);
}

#[tokio::test]
async fn panicking_handler_dead_letters_message_and_keeps_consuming() {
    let bus = Arc::new(InMemoryMessageBus::default());
    let dlq = InMemoryDeadLetterQueue::new(10);
    let cancel = CancellationToken::new();
    let consumer =
        MessageConsumer::new(bus.clone(), middleware(fast_policy(3), Arc::new(dlq.clone())))
            .with_cancellation(cancel.clone());

    let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let fragile = handler_fn("ProvisionMailbox", move |event: UserRegistered, _| {
        let counter = Arc::clone(&counter);
        async move {
            assert!(event.email.contains('@'), "malformed address");
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    });
    let handle = consumer.spawn(Some("users-events"), fragile).await.unwrap();

    for email in ["no-at-sign", "ana@example.com"] {
        bus.send(&Envelope::from_event(&UserRegistered::new(email)).unwrap(), Some("users-events"))
            .await
            .unwrap();
    }

    wait_until(|| delivered.load(std::sync::atomic::Ordering::SeqCst) == 1).await;
    assert!(!handle.is_finished());
    let stats = stop(&cancel, handle).await;

    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dead_lettered, 1);
    let entry = dlq.peek().unwrap();
    assert_eq!(entry.error_kind, kinds::PANIC);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.handler_type, "ProvisionMailbox");
}

#[tokio::test]
async fn type_filter_skips_other_messages_on_shared_destination() {
    let bus = Arc::new(InMemoryMessageBus::new("marketplace-events"));
    let dlq = InMemoryDeadLetterQueue::new(10);
    let cancel = CancellationToken::new();
    let consumer =
        MessageConsumer::new(bus.clone(), middleware(fast_policy(3), Arc::new(dlq.clone())))
            .with_cancellation(cancel.clone())
        .filter_by_type(true);

    let recorder = RecordingHandler::<UserRegistered>::new("WelcomeEmail");
    let handle = consumer.spawn(None, recorder.clone()).await.unwrap();

    let publisher = IntegrationEventPublisher::new(bus.clone(), Arc::new(TopicSelector::default()));
    publisher.publish(&JobPosted::new(Uuid::now_v7(), "Fix sink")).await.unwrap();
    publisher.publish(&UserRegistered::new("ana@example.com")).await.unwrap();

    wait_until(|| recorder.count() == 1).await;
    let stats = stop(&cancel, handle).await;

    assert_eq!(stats.received, 2);
    assert_eq!(stats.skipped, 1);
    assert!(dlq.is_empty());
}

#[tokio::test]
async fn failing_sink_stops_consumer() {
    let bus = Arc::new(InMemoryMessageBus::default());
    let dead_letter_bus = InMemoryMessageBus::default();
    dead_letter_bus.set_failing(true);
    let sink = MessageBusDeadLetterSink::new(Arc::new(dead_letter_bus));
    let consumer = MessageConsumer::new(bus.clone(), middleware(fast_policy(1), Arc::new(sink)));

    let broken = ScriptedHandler::always_failing("SyncCrm", HandlerError::io("down"));
    let handle = consumer
        .spawn::<UserRegistered, _>(Some("users-events"), broken)
        .await
        .unwrap();

    let registered = Envelope::from_event(&UserRegistered::new("ana@example.com")).unwrap();
    bus.send(&registered, Some("users-events"))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumer did not stop")
        .expect("consumer task panicked");

    assert!(result.is_err());
}

// ============================================================================
// Unit of work → integration events
// ============================================================================

#[tokio::test]
async fn domain_events_fan_out_to_integration_events() {
    let bus = InMemoryMessageBus::default();
    let publisher = IntegrationEventPublisher::new(Arc::new(bus.clone()), domain_selector());

    let mut registry = HandlerRegistry::new();
    let publish_job_posted = handler_fn("PublishJobPosted", move |event: JobCreated, _cancel| {
        let publisher = publisher.clone();
        async move {
            publisher
                .publish(&JobPosted::new(event.aggregate_id(), event.title))
                .await
                .map_err(|err| HandlerError::broker(err.to_string()))
        }
    });
    registry.register::<JobCreated, _>(publish_job_posted);
    let cancelled = RecordingHandler::<JobCancelled>::new("NotifyProviders");
    registry.register::<JobCancelled, _>(cancelled.clone());

    let job_id = Uuid::now_v7();
    let mut buffer = DomainEventBuffer::new();
    buffer.record(JobCreated::new(job_id, "Paint fence"));
    buffer.record(JobCancelled::new(job_id, 2, "customer changed plans"));

    DomainEventProcessor::new(Arc::new(registry))
        .process_buffer(&mut buffer)
        .await
        .unwrap();

    let posted: JobPosted = bus.published_to("jobs-events")[0].decode().unwrap();
    assert_eq!(posted.job_id, job_id);
    assert_eq!(cancelled.count(), 1);
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn dispatcher_failure_does_not_block_publishing_sibling() {
    let bus = InMemoryMessageBus::default();
    let publisher = IntegrationEventPublisher::new(Arc::new(bus.clone()), domain_selector());

    let mut registry = HandlerRegistry::new();
    registry.register::<JobCreated, _>(ScriptedHandler::always_failing(
        "IndexSearch",
        HandlerError::io("search down"),
    ));
    let publish_job_posted = handler_fn("PublishJobPosted", move |event: JobCreated, _cancel| {
        let publisher = publisher.clone();
        async move {
            publisher
                .publish(&JobPosted::new(event.aggregate_id(), event.title))
                .await
                .map_err(|err| HandlerError::broker(err.to_string()))
        }
    });
    registry.register::<JobCreated, _>(publish_job_posted);

    let report = EventDispatcher::new(Arc::new(registry))
        .publish_with_report(&JobCreated::new(Uuid::now_v7(), "Paint fence"))
        .await;

    assert_eq!(report.handlers, 2);
    assert_eq!(report.failed_handlers, vec!["IndexSearch"]);
    assert_eq!(bus.published_to("jobs-events").len(), 1);
}
