//! Process-local [`MessageBus`] for tests and the `testing` environment.
//!
//! - `publish` delivers a copy to every live subscription of the destination
//!   (dropped if there is none)
//! - `send` delivers to one subscription, round-robin; with no subscription
//!   the envelope is buffered and flushed to the first subscriber
//! - the most recent publishes and sends are recorded for assertions
//!   (bounded by [`InMemoryMessageBus::with_recording_limit`])

use async_stream::stream;
use marketplace_events_core::message_bus::{
    BusFuture, Envelope, EnvelopeStream, MessageBus, MessageBusError,
};
use marketplace_events_core::routing::DEFAULT_DESTINATION;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Recorded publishes and sends kept per bus by default.
pub const DEFAULT_RECORDING_LIMIT: usize = 10_000;

type Subscriber = mpsc::UnboundedSender<Result<Envelope, MessageBusError>>;
type Recording = VecDeque<(String, Envelope)>;

struct State {
    subscribers: HashMap<String, Vec<Subscriber>>,
    pending: HashMap<String, VecDeque<Envelope>>,
    cursor: HashMap<String, usize>,
    published: Recording,
    sent: Recording,
    recording_limit: usize,
    failing: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            subscribers: HashMap::new(),
            pending: HashMap::new(),
            cursor: HashMap::new(),
            published: VecDeque::new(),
            sent: VecDeque::new(),
            recording_limit: DEFAULT_RECORDING_LIMIT,
            failing: false,
        }
    }
}

/// Append to `log`, dropping the oldest entries beyond `limit`.
fn record(log: &mut Recording, limit: usize, destination: &str, envelope: &Envelope) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back((destination.to_string(), envelope.clone()));
}

impl State {
    fn live_subscribers(&mut self, destination: &str) -> &mut Vec<Subscriber> {
        let subscribers = self.subscribers.entry(destination.to_string()).or_default();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers
    }
}

/// In-memory message bus.
///
/// Clones share state.
///
/// ```
/// use futures::StreamExt;
/// use marketplace_events_core::message_bus::{Envelope, MessageBus};
/// use marketplace_events_testing::InMemoryMessageBus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryMessageBus::new("marketplace");
/// let mut stream = bus.subscribe(Some("users-events")).await?;
///
/// let envelope = Envelope::from_message(&"hello", "Tests")?;
/// bus.publish(&envelope, Some("users-events")).await?;
///
/// assert_eq!(stream.next().await.unwrap()?, envelope);
/// assert_eq!(bus.published_to("users-events").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<State>>,
    default_destination: String,
}

impl InMemoryMessageBus {
    /// Bus falling back to `default_destination`.
    #[must_use]
    pub fn new(default_destination: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            default_destination: default_destination.into(),
        }
    }

    /// Keep at most `limit` recorded publishes and sends each, oldest
    /// dropped first. Zero turns recording off.
    #[must_use]
    pub fn with_recording_limit(self, limit: usize) -> Self {
        {
            let mut state = self.state();
            state.recording_limit = limit;
            while state.published.len() > limit {
                state.published.pop_front();
            }
            while state.sent.len() > limit {
                state.sent.pop_front();
            }
        }
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every publish and send fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Every `(destination, envelope)` published, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.state().published.iter().cloned().collect()
    }

    /// Envelopes published to `destination`.
    #[must_use]
    pub fn published_to(&self, destination: &str) -> Vec<Envelope> {
        self.state()
            .published
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Every `(destination, envelope)` sent, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.state().sent.iter().cloned().collect()
    }

    /// Envelopes sent to `destination`.
    #[must_use]
    pub fn sent_to(&self, destination: &str) -> Vec<Envelope> {
        self.state()
            .sent
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Envelopes sent to `destination` that no subscriber has taken yet.
    #[must_use]
    pub fn pending(&self, destination: &str) -> usize {
        self.state().pending.get(destination).map_or(0, VecDeque::len)
    }

    /// Live subscriptions on `destination`.
    #[must_use]
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.state().live_subscribers(destination).len()
    }

    /// Forget recorded traffic and buffered envelopes.
    pub fn clear(&self) {
        let mut state = self.state();
        state.published.clear();
        state.sent.clear();
        state.pending.clear();
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_DESTINATION)
    }
}

impl MessageBus for InMemoryMessageBus {
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
        destination: Option<&'a str>,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let destination = self.resolve(destination);
            let mut state = self.state();

            if state.failing {
                return Err(MessageBusError::SendFailed {
                    destination: destination.to_string(),
                    reason: "in-memory bus set to fail".to_string(),
                });
            }

            let limit = state.recording_limit;
            record(&mut state.sent, limit, destination, envelope);

            let subscribers = state.live_subscribers(destination).clone();
            if subscribers.is_empty() {
                state
                    .pending
                    .entry(destination.to_string())
                    .or_default()
                    .push_back(envelope.clone());
                return Ok(());
            }

            let cursor = state.cursor.entry(destination.to_string()).or_default();
            let index = *cursor % subscribers.len();
            *cursor = index + 1;

            if subscribers[index].send(Ok(envelope.clone())).is_err() {
                state
                    .pending
                    .entry(destination.to_string())
                    .or_default()
                    .push_back(envelope.clone());
            }
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
            let mut state = self.state();

            if state.failing {
                return Err(MessageBusError::PublishFailed {
                    destination: destination.to_string(),
                    reason: "in-memory bus set to fail".to_string(),
                });
            }

            let limit = state.recording_limit;
            record(&mut state.published, limit, destination, envelope);
            for tx in state.live_subscribers(destination).iter() {
                let _ = tx.send(Ok(envelope.clone()));
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, subscription: Option<&'a str>) -> BusFuture<'a, EnvelopeStream> {
        Box::pin(async move {
            let destination = self.resolve(subscription).to_string();
            let (tx, mut rx) = mpsc::unbounded_channel();

            {
                let mut state = self.state();
                if let Some(pending) = state.pending.remove(&destination) {
                    for envelope in pending {
                        let _ = tx.send(Ok(envelope));
                    }
                }
                state.subscribers.entry(destination).or_default().push(tx);
            }

            let stream: EnvelopeStream = Box::pin(stream! {
                while let Some(item) = rx.recv().await {
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn envelope(n: u32) -> Envelope {
        Envelope::from_message(&n, "Tests").unwrap()
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let bus = InMemoryMessageBus::new("marketplace");
        let mut first = bus.subscribe(None).await.unwrap();
        let mut second = bus.subscribe(Some("marketplace")).await.unwrap();

        bus.publish(&envelope(1), None).await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap().decode::<u32>().unwrap(), 1);
        assert_eq!(second.next().await.unwrap().unwrap().decode::<u32>().unwrap(), 1);
        assert_eq!(bus.published_to("marketplace").len(), 1);
    }

    #[tokio::test]
    async fn send_round_robins_between_subscribers() {
        let bus = InMemoryMessageBus::default();
        let mut first = bus.subscribe(Some("payouts")).await.unwrap();
        let mut second = bus.subscribe(Some("payouts")).await.unwrap();

        for n in 0..4 {
            bus.send(&envelope(n), Some("payouts")).await.unwrap();
        }

        let a: Vec<u32> = vec![
            first.next().await.unwrap().unwrap().decode().unwrap(),
            first.next().await.unwrap().unwrap().decode().unwrap(),
        ];
        let b: Vec<u32> = vec![
            second.next().await.unwrap().unwrap().decode().unwrap(),
            second.next().await.unwrap().unwrap().decode().unwrap(),
        ];
        assert_eq!(a, vec![0, 2]);
        assert_eq!(b, vec![1, 3]);
    }

    #[tokio::test]
    async fn send_without_subscriber_is_buffered() {
        let bus = InMemoryMessageBus::default();
        bus.send(&envelope(7), Some("invoices")).await.unwrap();
        assert_eq!(bus.pending("invoices"), 1);

        let mut stream = bus.subscribe(Some("invoices")).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().decode::<u32>().unwrap(), 7);
        assert_eq!(bus.pending("invoices"), 0);
    }

    #[tokio::test]
    async fn default_destination_is_used_when_omitted() {
        let bus = InMemoryMessageBus::default();
        bus.publish(&envelope(1), None).await.unwrap();

        assert_eq!(bus.default_destination(), DEFAULT_DESTINATION);
        assert_eq!(bus.published()[0].0, DEFAULT_DESTINATION);
    }

    #[tokio::test]
    async fn failing_bus_rejects_traffic() {
        let bus = InMemoryMessageBus::default();
        bus.set_failing(true);

        assert!(matches!(
            bus.publish(&envelope(1), Some("x")).await,
            Err(MessageBusError::PublishFailed { .. })
        ));
        assert!(matches!(
            bus.send(&envelope(1), Some("x")).await,
            Err(MessageBusError::SendFailed { .. })
        ));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn recording_keeps_only_the_most_recent_traffic() {
        let bus = InMemoryMessageBus::default().with_recording_limit(2);
        for n in 0..5 {
            bus.publish(&envelope(n), Some("reviews")).await.unwrap();
            bus.send(&envelope(n), Some("payouts")).await.unwrap();
        }

        let published: Vec<u32> = bus
            .published_to("reviews")
            .iter()
            .map(|envelope| envelope.decode().unwrap())
            .collect();
        assert_eq!(published, vec![3, 4]);
        assert_eq!(bus.sent().len(), 2);
        // Buffering for absent subscribers is unaffected.
        assert_eq!(bus.pending("payouts"), 5);
    }

    #[tokio::test]
    async fn zero_recording_limit_still_delivers() {
        let bus = InMemoryMessageBus::default().with_recording_limit(0);
        let mut stream = bus.subscribe(Some("reviews")).await.unwrap();

        bus.publish(&envelope(9), Some("reviews")).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().decode::<u32>().unwrap(), 9);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = InMemoryMessageBus::default();
        let stream = bus.subscribe(Some("jobs")).await.unwrap();
        assert_eq!(bus.subscriber_count("jobs"), 1);

        drop(stream);

        assert_eq!(bus.subscriber_count("jobs"), 0);
        bus.send(&envelope(3), Some("jobs")).await.unwrap();
        assert_eq!(bus.pending("jobs"), 1);
    }
}
