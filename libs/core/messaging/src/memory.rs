//! Process-local broker with JetStream work-queue semantics.
//!
//! Used by tests and by `NATS_URL=memory://` single-process runs. Supports the
//! subset of JetStream behaviour the probe pipeline relies on:
//!
//! - publishing is rejected unless a stream subject matches
//! - durable consumers see every stored message matching their filter,
//!   including those published before the consumer was created
//! - subscriptions sharing a durable name compete for messages
//! - unacknowledged deliveries are redelivered after `ack_wait`
//! - `nak` redelivers (optionally delayed), `term` drops the message
//! - `max_ack_pending` and `max_deliver` are enforced per consumer
//! - retention is limits based: settled messages stay stored, and once the
//!   stream holds more than its message limit the oldest are discarded

use crate::queue::{Acker, Delivery, DeliveryStream, JobQueue};
use crate::subject::{is_publishable, matches};
use crate::{ConsumerSpec, QueueError};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Message limit of the in-memory stream unless overridden.
pub const DEFAULT_MAX_MESSAGES: usize = 100_000;

/// A message persisted by the in-memory stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
}

/// In-memory [`JobQueue`]. Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    subjects: Vec<String>,
    messages: BTreeMap<u64, StoredMessage>,
    max_messages: Option<usize>,
    last_sequence: u64,
    last_lease: u64,
    consumers: HashMap<String, ConsumerState>,
    closed: bool,
}

struct ConsumerState {
    spec: ConsumerSpec,
    ready: VecDeque<Pending>,
    leased: HashMap<u64, Lease>,
    delivered: HashMap<u64, u64>,
}

struct Pending {
    sequence: u64,
    not_before: Option<Instant>,
}

struct Lease {
    id: u64,
    deadline: Instant,
}

enum Settle {
    Ack,
    Nak(Option<Duration>),
    Term,
}

impl ConsumerState {
    fn new(spec: ConsumerSpec, messages: &BTreeMap<u64, StoredMessage>) -> Self {
        let ready = messages
            .values()
            .filter(|message| matches(&spec.filter_subject, &message.subject))
            .map(|message| Pending {
                sequence: message.sequence,
                not_before: None,
            })
            .collect();

        Self {
            spec,
            ready,
            leased: HashMap::new(),
            delivered: HashMap::new(),
        }
    }

    fn offer(&mut self, message: &StoredMessage) {
        if matches(&self.spec.filter_subject, &message.subject) {
            self.ready.push_back(Pending {
                sequence: message.sequence,
                not_before: None,
            });
        }
    }

    /// Drop every reference to a discarded message.
    fn forget(&mut self, sequence: u64) {
        self.ready.retain(|pending| pending.sequence != sequence);
        self.leased.remove(&sequence);
        self.delivered.remove(&sequence);
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in expired {
            self.leased.remove(&sequence);
            debug!(
                durable = %self.spec.durable_name,
                sequence,
                "Ack wait elapsed, redelivering"
            );
            self.requeue(sequence, None);
        }
    }

    fn requeue(&mut self, sequence: u64, not_before: Option<Instant>) {
        let delivered = self.delivered.get(&sequence).copied().unwrap_or(0);
        if self.spec.allows_redelivery(delivered) {
            self.ready.push_front(Pending {
                sequence,
                not_before,
            });
        } else {
            self.delivered.remove(&sequence);
            debug!(
                durable = %self.spec.durable_name,
                sequence,
                delivered,
                "Max deliveries reached, dropping message"
            );
        }
    }

    fn has_capacity(&self) -> bool {
        self.spec.max_ack_pending <= 0 || (self.leased.len() as i64) < self.spec.max_ack_pending
    }

    fn take_ready(&mut self, now: Instant) -> Option<u64> {
        if !self.has_capacity() {
            return None;
        }
        let index = self
            .ready
            .iter()
            .position(|pending| pending.not_before.map_or(true, |at| at <= now))?;
        self.ready.remove(index).map(|pending| pending.sequence)
    }

    fn next_wake(&self) -> Option<Instant> {
        let deadlines = self.leased.values().map(|lease| lease.deadline);
        let delayed = self.ready.iter().filter_map(|pending| pending.not_before);
        deadlines.chain(delayed).min()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose jobs stream is already bound to `subjects`.
    pub fn with_subjects<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = State {
            subjects: subjects.into_iter().map(Into::into).collect(),
            ..State::default()
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                changed: Notify::new(),
            }),
        }
    }

    /// Keep at most `max` messages, discarding the oldest first.
    pub async fn set_max_messages(&self, max: usize) {
        self.inner.state.lock().await.max_messages = Some(max.max(1));
    }

    /// Every message still stored, in publish order.
    pub async fn published(&self) -> Vec<StoredMessage> {
        let state = self.inner.state.lock().await;
        state.messages.values().cloned().collect()
    }

    /// Messages waiting for or leased to `durable` that are not yet settled.
    pub async fn outstanding(&self, durable: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .consumers
            .get(durable)
            .map_or(0, |consumer| consumer.ready.len() + consumer.leased.len())
    }
}

async fn next_delivery(inner: &Arc<Inner>, durable: &str) -> Option<Result<Delivery, QueueError>> {
    loop {
        let changed = inner.changed.notified();

        let wake_at = {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return None;
            }

            let now = Instant::now();
            let consumer = state.consumers.get_mut(durable)?;
            consumer.expire_leases(now);

            if let Some(sequence) = consumer.take_ready(now) {
                let Some(message) = state.messages.get(&sequence) else {
                    continue;
                };

                state.last_lease += 1;
                let lease_id = state.last_lease;

                let count = consumer.delivered.entry(sequence).or_insert(0);
                *count += 1;
                let delivery_count = *count;

                consumer.leased.insert(
                    sequence,
                    Lease {
                        id: lease_id,
                        deadline: now + consumer.spec.ack_wait,
                    },
                );

                let acker = MemoryAcker {
                    inner: inner.clone(),
                    durable: durable.to_string(),
                    sequence,
                    lease_id,
                };
                return Some(Ok(Delivery::new(
                    message.subject.clone(),
                    message.payload.clone(),
                    delivery_count,
                    Box::new(acker),
                )));
            }

            consumer.next_wake()
        };

        match wake_at {
            Some(at) => {
                tokio::select! {
                    _ = changed => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => changed.await,
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        if !is_publishable(subject) {
            return Err(QueueError::InvalidSubject(subject.to_string()));
        }

        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !state.subjects.iter().any(|pattern| matches(pattern, subject)) {
                return Err(QueueError::publish(subject, "no stream is bound to the subject"));
            }

            state.last_sequence += 1;
            let message = StoredMessage {
                sequence: state.last_sequence,
                subject: subject.to_string(),
                payload,
            };
            for consumer in state.consumers.values_mut() {
                consumer.offer(&message);
            }
            state.messages.insert(message.sequence, message);

            let limit = state.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
            while state.messages.len() > limit {
                let Some((sequence, _)) = state.messages.pop_first() else {
                    break;
                };
                debug!(sequence, "Message limit reached, discarding oldest message");
                for consumer in state.consumers.values_mut() {
                    consumer.forget(sequence);
                }
            }
        }

        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn provisioned_subjects(&self) -> Result<Vec<String>, QueueError> {
        let state = self.inner.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        Ok(state.subjects.clone())
    }

    async fn ensure_stream(&self, subjects: &[String]) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        for subject in subjects {
            if !state.subjects.contains(subject) {
                state.subjects.push(subject.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<DeliveryStream, QueueError> {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !state
                .subjects
                .iter()
                .any(|pattern| matches(pattern, &spec.filter_subject))
            {
                return Err(QueueError::consumer(
                    &spec.durable_name,
                    format!("filter '{}' is not bound to the stream", spec.filter_subject),
                ));
            }

            match state.consumers.get_mut(&spec.durable_name) {
                Some(existing) => existing.spec = spec.clone(),
                None => {
                    let consumer = ConsumerState::new(spec.clone(), &state.messages);
                    state.consumers.insert(spec.durable_name.clone(), consumer);
                }
            }
        }

        let stream = futures::stream::unfold(
            (self.inner.clone(), spec.durable_name.clone()),
            |(inner, durable)| async move {
                let next = next_delivery(&inner, &durable).await;
                next.map(|item| (item, (inner, durable)))
            },
        );
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.state.lock().await.closed = true;
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    durable: String,
    sequence: u64,
    lease_id: u64,
}

impl MemoryAcker {
    async fn settle(&self, outcome: Settle) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            let consumer = state
                .consumers
                .get_mut(&self.durable)
                .ok_or_else(|| QueueError::consumer(&self.durable, "consumer does not exist"))?;

            // The lease expired and the message went to another subscriber.
            let current = consumer.leased.get(&self.sequence).map(|lease| lease.id);
            if current != Some(self.lease_id) {
                debug!(
                    durable = %self.durable,
                    sequence = self.sequence,
                    "Ignoring settlement of an expired lease"
                );
                return Ok(());
            }

            consumer.leased.remove(&self.sequence);
            match outcome {
                Settle::Ack | Settle::Term => {
                    consumer.delivered.remove(&self.sequence);
                }
                Settle::Nak(delay) => {
                    let not_before = delay.map(|delay| Instant::now() + delay);
                    consumer.requeue(self.sequence, not_before);
                }
            }
        }

        self.inner.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.settle(Settle::Ack).await
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.settle(Settle::Nak(delay)).await
    }

    async fn term(&self) -> Result<(), QueueError> {
        self.settle(Settle::Term).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_millis(100);

    fn broker() -> InMemoryQueue {
        InMemoryQueue::with_subjects(["jobs.eu.*", "jobs.us.*", "jobs.results"])
    }

    async fn expect_idle(stream: &mut DeliveryStream) {
        assert!(
            tokio::time::timeout(IDLE, stream.next()).await.is_err(),
            "expected no delivery"
        );
    }

    #[tokio::test]
    async fn test_region_consumers_only_see_their_region() {
        let queue = broker();
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();
        let mut us = queue.subscribe(&ConsumerSpec::for_region("us")).await.unwrap();

        queue
            .publish("jobs.eu.trace", b"https://example.com".to_vec())
            .await
            .unwrap();

        let delivery = eu.next().await.unwrap().unwrap();
        assert_eq!(delivery.subject(), "jobs.eu.trace");
        assert_eq!(delivery.payload_str().unwrap(), "https://example.com");
        assert_eq!(delivery.delivery_count(), 1);
        delivery.ack().await.unwrap();

        expect_idle(&mut us).await;
        assert_eq!(queue.outstanding("worker_eu").await, 0);
    }

    #[tokio::test]
    async fn test_messages_published_before_consumer_exists_are_delivered() {
        let queue = broker();
        queue.publish("jobs.us.trace", b"a".to_vec()).await.unwrap();

        let mut us = queue.subscribe(&ConsumerSpec::for_region("us")).await.unwrap();
        let delivery = us.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), b"a");
    }

    #[tokio::test]
    async fn test_settled_messages_are_retained_for_new_consumers() {
        let queue = broker();
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        queue.publish("jobs.eu.trace", b"a".to_vec()).await.unwrap();
        eu.next().await.unwrap().unwrap().ack().await.unwrap();

        assert_eq!(queue.published().await.len(), 1);
        let mut replay = queue
            .subscribe(&ConsumerSpec::new("replay", "jobs.eu.*"))
            .await
            .unwrap();
        assert_eq!(replay.next().await.unwrap().unwrap().payload(), b"a");
    }

    #[tokio::test]
    async fn test_message_limit_discards_oldest() {
        let queue = broker();
        queue.set_max_messages(2).await;
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        for payload in [b"a", b"b", b"c"] {
            queue.publish("jobs.eu.trace", payload.to_vec()).await.unwrap();
        }

        let stored: Vec<Vec<u8>> = queue
            .published()
            .await
            .into_iter()
            .map(|message| message.payload)
            .collect();
        assert_eq!(stored, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(queue.outstanding("worker_eu").await, 2);

        assert_eq!(eu.next().await.unwrap().unwrap().payload(), b"b");
        assert_eq!(eu.next().await.unwrap().unwrap().payload(), b"c");
    }

    #[tokio::test]
    async fn test_same_durable_subscriptions_compete() {
        let queue = broker();
        let spec = ConsumerSpec::for_region("eu");
        let mut first = queue.subscribe(&spec).await.unwrap();
        let mut second = queue.subscribe(&spec).await.unwrap();

        queue.publish("jobs.eu.trace", b"one".to_vec()).await.unwrap();
        queue.publish("jobs.eu.trace", b"two".to_vec()).await.unwrap();

        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_ne!(a.payload(), b.payload());

        expect_idle(&mut first).await;
        expect_idle(&mut second).await;
    }

    #[tokio::test]
    async fn test_nak_redelivers() {
        let queue = broker();
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();
        queue.publish("jobs.eu.trace", b"x".to_vec()).await.unwrap();

        let delivery = eu.next().await.unwrap().unwrap();
        assert!(!delivery.is_redelivery());
        delivery.nak(None).await.unwrap();

        let redelivered = eu.next().await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_count(), 2);
        assert!(redelivered.is_redelivery());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_is_redelivered_after_ack_wait() {
        let queue = broker();
        let spec = ConsumerSpec::for_region("eu").with_ack_wait(Duration::from_secs(5));
        let mut eu = queue.subscribe(&spec).await.unwrap();
        queue.publish("jobs.eu.trace", b"x".to_vec()).await.unwrap();

        let started = Instant::now();
        let abandoned = eu.next().await.unwrap().unwrap();
        drop(abandoned);

        let redelivered = eu.next().await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_count(), 2);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_with_delay_waits() {
        let queue = broker();
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();
        queue.publish("jobs.eu.trace", b"x".to_vec()).await.unwrap();

        let delivery = eu.next().await.unwrap().unwrap();
        let started = Instant::now();
        delivery.nak(Some(Duration::from_secs(2))).await.unwrap();

        let redelivered = eu.next().await.unwrap().unwrap();
        assert_eq!(redelivered.delivery_count(), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_max_ack_pending_limits_leases() {
        let queue = broker();
        let spec = ConsumerSpec::for_region("eu").with_max_ack_pending(1);
        let mut eu = queue.subscribe(&spec).await.unwrap();

        queue.publish("jobs.eu.trace", b"one".to_vec()).await.unwrap();
        queue.publish("jobs.eu.trace", b"two".to_vec()).await.unwrap();

        let first = eu.next().await.unwrap().unwrap();
        assert_eq!(first.payload(), b"one");
        expect_idle(&mut eu).await;

        first.ack().await.unwrap();
        let second = eu.next().await.unwrap().unwrap();
        assert_eq!(second.payload(), b"two");
    }

    #[tokio::test]
    async fn test_term_stops_redelivery() {
        let queue = broker();
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();
        queue.publish("jobs.eu.trace", b"x".to_vec()).await.unwrap();

        eu.next().await.unwrap().unwrap().term().await.unwrap();

        expect_idle(&mut eu).await;
        assert_eq!(queue.outstanding("worker_eu").await, 0);
    }

    #[tokio::test]
    async fn test_max_deliver_drops_message() {
        let queue = broker();
        let spec = ConsumerSpec::for_region("eu").with_max_deliver(2);
        let mut eu = queue.subscribe(&spec).await.unwrap();
        queue.publish("jobs.eu.trace", b"x".to_vec()).await.unwrap();

        eu.next().await.unwrap().unwrap().nak(None).await.unwrap();
        let last = eu.next().await.unwrap().unwrap();
        assert_eq!(last.delivery_count(), 2);
        last.nak(None).await.unwrap();

        expect_idle(&mut eu).await;
        assert_eq!(queue.outstanding("worker_eu").await, 0);
    }

    #[tokio::test]
    async fn test_publish_requires_bound_subject() {
        let queue = broker();

        let err = queue
            .publish("jobs.xx.trace", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Publish { .. }));
        assert!(err.is_unavailable());

        let err = queue.publish("jobs.eu.*", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSubject(_)));

        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_requires_bound_filter() {
        let queue = broker();
        let result = queue.subscribe(&ConsumerSpec::for_region("ap")).await;
        assert!(matches!(result, Err(QueueError::Consumer { .. })));
    }

    #[tokio::test]
    async fn test_ensure_stream_adds_missing_subjects() {
        let queue = InMemoryQueue::new();
        queue
            .ensure_stream(&["jobs.eu.*".to_string(), "jobs.results".to_string()])
            .await
            .unwrap();
        queue
            .ensure_stream(&["jobs.eu.*".to_string(), "jobs.us.*".to_string()])
            .await
            .unwrap();

        assert_eq!(
            queue.provisioned_subjects().await.unwrap(),
            vec!["jobs.eu.*", "jobs.results", "jobs.us.*"]
        );
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let queue = broker();
        let mut eu = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        queue.close().await.unwrap();

        assert!(eu.next().await.is_none());
        assert!(matches!(
            queue.publish("jobs.eu.trace", b"x".to_vec()).await,
            Err(QueueError::Closed)
        ));
    }
}
