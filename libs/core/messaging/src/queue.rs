//! Backend-agnostic job queue abstraction.

use crate::{ConsumerSpec, QueueError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Stream of deliveries for one durable consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// Durable, subject-addressed work queue.
///
/// Implemented by [`NatsQueue`](crate::NatsQueue) (JetStream) and
/// [`InMemoryQueue`](crate::InMemoryQueue) (process-local broker).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish `payload` on a concrete subject and wait for the broker to
    /// persist it.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Subjects the jobs stream is bound to.
    async fn provisioned_subjects(&self) -> Result<Vec<String>, QueueError>;

    /// Create the jobs stream if missing and bind any missing `subjects` to it.
    async fn ensure_stream(&self, subjects: &[String]) -> Result<(), QueueError>;

    /// Register (create-or-update) a durable consumer and stream its deliveries.
    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<DeliveryStream, QueueError>;

    /// Flush pending work and release the connection.
    async fn close(&self) -> Result<(), QueueError>;

    /// Short backend label for logs.
    fn backend(&self) -> &'static str;
}

/// Settles a single leased delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;

    /// Negative acknowledgement; the message becomes eligible for redelivery
    /// after `delay` (immediately when `None`).
    async fn nak(&self, delay: Option<Duration>) -> Result<(), QueueError>;

    /// Stop redelivering the message.
    async fn term(&self) -> Result<(), QueueError>;
}

/// A message leased to this subscriber.
///
/// Settling consumes the delivery so it can be acknowledged at most once.
pub struct Delivery {
    subject: String,
    payload: Vec<u8>,
    delivery_count: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        delivery_count: u64,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            delivery_count,
            acker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// How many times the broker has delivered this message, starting at 1.
    pub fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn nak(self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.acker.nak(delay).await
    }

    pub async fn term(self) -> Result<(), QueueError> {
        self.acker.term().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}
