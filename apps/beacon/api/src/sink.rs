//! Durable subscription on `jobs.results`.
//!
//! Results are telemetry: each one is logged and acknowledged. Payloads that
//! are not trace results are terminated so they are not redelivered forever.

use futures::StreamExt;
use messaging::{ConsumerSpec, Delivery, DeliveryStream, JobQueue, QueueError};
use probe::TraceResult;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    Recorded(TraceResult),
    Rejected,
}

pub struct ResultSink {
    queue: Arc<dyn JobQueue>,
    spec: ConsumerSpec,
}

impl ResultSink {
    pub fn new(queue: Arc<dyn JobQueue>, durable_name: &str) -> Self {
        Self {
            queue,
            spec: ConsumerSpec::for_results(durable_name),
        }
    }

    /// Subscribe and consume in the background until `shutdown` flips.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, QueueError> {
        let deliveries = self.queue.subscribe(&self.spec).await?;
        info!(durable = %self.spec.durable_name, "Result sink subscribed");
        Ok(tokio::spawn(consume(deliveries, shutdown)))
    }
}

async fn consume(mut deliveries: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Result sink stopping");
                break;
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = handle(delivery).await {
                        warn!(error = %e, "Failed to settle trace result");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Result subscription error"),
                None => {
                    warn!("Result subscription closed");
                    break;
                }
            }
        }
    }
}

pub async fn handle(delivery: Delivery) -> Result<SinkOutcome, QueueError> {
    match TraceResult::from_json(delivery.payload()) {
        Ok(result) => {
            info!(
                url = %result.url,
                status = result.status,
                dns_ns = result.metrics.dns.as_nanos() as u64,
                connect_ns = result.metrics.connect.as_nanos() as u64,
                tls_ns = result.metrics.tls.as_nanos() as u64,
                ttfb_ns = result.metrics.time_to_first_byte.as_nanos() as u64,
                total_ns = result.metrics.total.as_nanos() as u64,
                redelivered = delivery.is_redelivery(),
                "Trace result"
            );
            delivery.ack().await?;
            Ok(SinkOutcome::Recorded(result))
        }
        Err(e) => {
            warn!(error = %e, subject = %delivery.subject(), "Discarding malformed trace result");
            delivery.term().await?;
            Ok(SinkOutcome::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::InMemoryQueue;
    use probe::Metrics;
    use std::time::Duration;

    fn result() -> TraceResult {
        TraceResult {
            url: "https://example.com".to_string(),
            status: 200,
            metrics: Metrics {
                time_to_first_byte: Duration::from_millis(20),
                total: Duration::from_millis(25),
                ..Metrics::default()
            },
        }
    }

    async fn wait_until_settled(queue: &InMemoryQueue, durable: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.outstanding(durable).await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("results were not settled");
    }

    #[tokio::test]
    async fn test_handle_acks_results_and_terms_garbage() {
        let queue = InMemoryQueue::with_subjects(["jobs.results"]);
        let mut deliveries = queue
            .subscribe(&ConsumerSpec::for_results("API_RESULTS"))
            .await
            .unwrap();

        queue
            .publish("jobs.results", result().to_json().unwrap())
            .await
            .unwrap();
        queue.publish("jobs.results", b"garbage".to_vec()).await.unwrap();

        let first = handle(deliveries.next().await.unwrap().unwrap()).await.unwrap();
        assert_eq!(first, SinkOutcome::Recorded(result()));

        let second = handle(deliveries.next().await.unwrap().unwrap()).await.unwrap();
        assert_eq!(second, SinkOutcome::Rejected);

        assert_eq!(queue.outstanding("API_RESULTS").await, 0);
    }

    #[tokio::test]
    async fn test_sink_consumes_until_shutdown() {
        let queue = InMemoryQueue::with_subjects(["jobs.results"]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = ResultSink::new(Arc::new(queue.clone()), "API_RESULTS")
            .start(shutdown_rx)
            .await
            .unwrap();

        for _ in 0..3 {
            queue
                .publish("jobs.results", result().to_json().unwrap())
                .await
                .unwrap();
        }
        wait_until_settled(&queue, "API_RESULTS").await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sink did not stop")
            .unwrap();
    }
}
