use crate::queue::{Acker, Delivery, DeliveryStream, JobQueue};
use crate::{ConsumerSpec, QueueError};
use async_nats::jetstream::context::{GetStreamError, GetStreamErrorKind};
use async_nats::jetstream::{self, consumer, stream, AckKind, Context, ErrorCode};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use core_config::nats::NatsConfig;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// [`JobQueue`] backed by a JetStream stream.
#[derive(Clone)]
pub struct NatsQueue {
    client: Client,
    jetstream: Context,
    stream: String,
}

impl NatsQueue {
    /// Connect to the server named by `config.url`.
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let mut options = ConnectOptions::new();
        if let Some(name) = &config.connection_name {
            options = options.name(name);
        }

        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| QueueError::Connect {
                url: config.url.clone(),
                message: e.to_string(),
            })?;

        info!(url = %config.url, stream = %config.stream, "Connected to NATS");
        Ok(Self::from_client(client, &config.stream))
    }

    /// Wrap an existing connection.
    pub fn from_client(client: Client, stream: impl Into<String>) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            stream: stream.into(),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    async fn get_stream(&self) -> Result<stream::Stream, QueueError> {
        self.jetstream
            .get_stream(&self.stream)
            .await
            .map_err(|e| QueueError::stream(&self.stream, e))
    }
}

/// Only a server-side "stream not found" means the stream should be created.
fn stream_missing(error: &GetStreamError) -> bool {
    matches!(
        error.kind(),
        GetStreamErrorKind::JetStream(source) if source.error_code() == ErrorCode::STREAM_NOT_FOUND
    )
}

#[async_trait]
impl JobQueue for NatsQueue {
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| QueueError::publish(subject, e))?
            .await
            .map_err(|e| QueueError::publish(subject, e))?;

        debug!(sequence = ack.sequence, stream = %ack.stream, "Message persisted");
        Ok(())
    }

    async fn provisioned_subjects(&self) -> Result<Vec<String>, QueueError> {
        let mut stream = self.get_stream().await?;
        let info = stream
            .info()
            .await
            .map_err(|e| QueueError::stream(&self.stream, e))?;
        Ok(info.config.subjects.clone())
    }

    async fn ensure_stream(&self, subjects: &[String]) -> Result<(), QueueError> {
        match self.jetstream.get_stream(&self.stream).await {
            Ok(mut existing) => {
                let info = existing
                    .info()
                    .await
                    .map_err(|e| QueueError::stream(&self.stream, e))?;
                let mut config = info.config.clone();

                let missing: Vec<String> = subjects
                    .iter()
                    .filter(|subject| !config.subjects.contains(subject))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    debug!(stream = %self.stream, "Stream already provisioned");
                    return Ok(());
                }

                config.subjects.extend(missing.iter().cloned());
                self.jetstream
                    .update_stream(&config)
                    .await
                    .map_err(|e| QueueError::stream(&self.stream, e))?;
                info!(stream = %self.stream, added = ?missing, "Bound subjects to stream");
            }
            Err(e) if stream_missing(&e) => {
                self.jetstream
                    .create_stream(stream::Config {
                        name: self.stream.clone(),
                        subjects: subjects.to_vec(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| QueueError::stream(&self.stream, e))?;
                info!(stream = %self.stream, subjects = ?subjects, "Created stream");
            }
            Err(e) => return Err(QueueError::stream(&self.stream, e)),
        }
        Ok(())
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> Result<DeliveryStream, QueueError> {
        let stream = self.get_stream().await?;

        let consumer = stream
            .create_consumer(consumer::pull::Config {
                name: Some(spec.name.clone()),
                durable_name: Some(spec.durable_name.clone()),
                description: spec.description.clone(),
                filter_subject: spec.filter_subject.clone(),
                ack_policy: consumer::AckPolicy::Explicit,
                deliver_policy: consumer::DeliverPolicy::All,
                ack_wait: spec.ack_wait,
                max_ack_pending: spec.max_ack_pending,
                max_deliver: spec.max_deliver,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::consumer(&spec.durable_name, e))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| QueueError::consumer(&spec.durable_name, e))?;

        info!(
            stream = %self.stream,
            durable = %spec.durable_name,
            filter = %spec.filter_subject,
            "Subscribed to durable consumer"
        );

        let durable = spec.durable_name.clone();
        Ok(messages
            .map(move |result| {
                result
                    .map(into_delivery)
                    .map_err(|e| QueueError::consumer(&durable, e))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.client
            .flush()
            .await
            .map_err(|_| QueueError::Closed)
    }

    fn backend(&self) -> &'static str {
        "nats"
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let delivery_count = message
        .info()
        .map(|info| info.delivered.max(1) as u64)
        .unwrap_or(1);
    let subject = message.subject.to_string();
    let payload = message.payload.to_vec();

    Delivery::new(subject, payload, delivery_count, Box::new(NatsAcker { message }))
}

/// Settles a JetStream message.
pub struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.message
            .ack()
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<(), QueueError> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}
