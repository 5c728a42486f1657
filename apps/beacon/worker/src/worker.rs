//! Regional worker loop.
//!
//! Every delivery from `worker_<region>` is handled on its own task, bounded
//! by a semaphore sized like the consumer's max-ack-pending. A job is acked
//! only once its trace result has been published on `jobs.results`; probe,
//! encoding and publish failures nack it for redelivery.

use crate::health::HealthState;
use crate::metrics::WorkerMetrics;
use futures::StreamExt;
use messaging::subject::RESULTS_SUBJECT;
use messaging::{ConsumerSpec, Delivery, JobQueue, QueueError};
use probe::{ProbeError, TraceResult, Tracer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Why a job could not be completed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("job payload is not valid UTF-8")]
    Undecodable,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("failed to serialize trace result: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to publish trace result: {0}")]
    Publish(#[source] QueueError),
}

impl DispatchError {
    /// Redelivering will never help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Undecodable)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Undecodable => "undecodable",
            Self::Probe(e) => e.failure.kind(),
            Self::Serialization(_) => "serialization",
            Self::Publish(_) => "publish",
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(TraceResult),
    Nacked,
    Terminated,
}

/// Probes one delivery and settles it. Cheap to clone into tasks.
#[derive(Clone)]
pub struct JobHandler {
    queue: Arc<dyn JobQueue>,
    tracer: Arc<dyn Tracer>,
    metrics: WorkerMetrics,
    nak_delay: Option<Duration>,
}

impl JobHandler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        tracer: Arc<dyn Tracer>,
        metrics: WorkerMetrics,
        nak_delay: Option<Duration>,
    ) -> Self {
        Self {
            queue,
            tracer,
            metrics,
            nak_delay,
        }
    }

    /// Process and settle `delivery`. Only settlement failures are errors.
    #[instrument(
        skip(self, delivery),
        fields(subject = %delivery.subject(), delivery_count = delivery.delivery_count())
    )]
    pub async fn handle(&self, delivery: Delivery) -> Result<JobOutcome, QueueError> {
        self.metrics.job_received();
        if delivery.is_redelivery() {
            debug!("Processing redelivered job");
        }

        match self.process(&delivery).await {
            Ok(result) => {
                delivery.ack().await?;
                self.metrics.probe_succeeded(result.metrics.total);
                debug!(url = %result.url, status = result.status, "Job completed");
                Ok(JobOutcome::Completed(result))
            }
            Err(e) if e.is_permanent() => {
                warn!(error = %e, "Terminating job");
                self.metrics.job_terminated();
                delivery.term().await?;
                Ok(JobOutcome::Terminated)
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Job failed, requesting redelivery");
                if matches!(e, DispatchError::Probe(_)) {
                    self.metrics.probe_failed(e.kind());
                }
                self.metrics.job_nacked();
                delivery.nak(self.nak_delay).await?;
                Ok(JobOutcome::Nacked)
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<TraceResult, DispatchError> {
        let target = delivery
            .payload_str()
            .map_err(|_| DispatchError::Undecodable)?;

        let result = self.tracer.trace(target).await?;
        let payload = result.to_json()?;

        self.queue
            .publish(RESULTS_SUBJECT, payload)
            .await
            .map_err(DispatchError::Publish)?;

        Ok(result)
    }
}

/// Pulls deliveries for one region and fans them out to [`JobHandler`] tasks.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: JobHandler,
    spec: ConsumerSpec,
    concurrency: usize,
    health: HealthState,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: JobHandler,
        spec: ConsumerSpec,
        concurrency: usize,
        health: HealthState,
    ) -> Self {
        Self {
            queue,
            handler,
            spec,
            concurrency: concurrency.max(1),
            health,
        }
    }

    /// Consume until `shutdown` flips to true or the subscription ends, then
    /// wait for in-flight jobs.
    ///
    /// Fails only if the durable consumer cannot be created.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let mut deliveries = match self.queue.subscribe(&self.spec).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.health.set_worker_healthy(false).await;
                self.health.set_error(Some(e.to_string())).await;
                return Err(e);
            }
        };
        self.health.set_consumer_attached(true).await;

        info!(
            durable = %self.spec.durable_name,
            filter = %self.spec.filter_subject,
            concurrency = self.concurrency,
            backend = self.queue.backend(),
            "Worker consuming"
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_task(joined);
            }

            // Hold a permit before pulling so the local pool never exceeds
            // the broker's in-flight limit.
            let permit = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let handler = self.handler.clone();
                    tasks.spawn(async move {
                        let outcome = handler.handle(delivery).await;
                        drop(permit);
                        outcome
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery error");
                    self.health.set_error(Some(e.to_string())).await;
                }
                None => {
                    warn!("Subscription closed");
                    self.health.set_error(Some("subscription closed".to_string())).await;
                    break;
                }
            }
        }

        self.health.set_consumer_attached(false).await;
        info!(in_flight = tasks.len(), "Worker stopping, draining in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            log_task(joined);
        }

        info!("Worker stopped");
        Ok(())
    }
}

fn log_task(joined: Result<Result<JobOutcome, QueueError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to settle job"),
        Err(e) => error!(error = %e, "Job task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use messaging::InMemoryQueue;
    use mockall::mock;
    use probe::{Metrics, ProbeFailure, Prober};
    use test_utils::{refused_url, TestTarget};

    mock! {
        pub Tracer {}

        #[async_trait]
        impl Tracer for Tracer {
            async fn trace(&self, target: &str) -> Result<TraceResult, ProbeError>;
        }
    }

    const JOB_SUBJECT: &str = "jobs.eu.trace";

    fn regional_queue() -> InMemoryQueue {
        InMemoryQueue::with_subjects(["jobs.eu.*", "jobs.results"])
    }

    fn handler(queue: &InMemoryQueue, tracer: Arc<dyn Tracer>) -> JobHandler {
        JobHandler::new(
            Arc::new(queue.clone()),
            tracer,
            WorkerMetrics::new("eu"),
            None,
        )
    }

    fn prober() -> Arc<dyn Tracer> {
        Arc::new(Prober::new(Duration::from_secs(2)).unwrap())
    }

    fn sample(url: &str) -> TraceResult {
        TraceResult {
            url: url.to_string(),
            status: 200,
            metrics: Metrics {
                time_to_first_byte: Duration::from_millis(3),
                total: Duration::from_millis(4),
                ..Metrics::default()
            },
        }
    }

    async fn results(queue: &InMemoryQueue) -> Vec<TraceResult> {
        queue
            .published()
            .await
            .into_iter()
            .filter(|message| message.subject == RESULTS_SUBJECT)
            .map(|message| TraceResult::from_json(&message.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_probe_publishes_result_then_acks() {
        let target = TestTarget::start().await;
        let url = target.url("/");
        let queue = regional_queue();
        let mut deliveries = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        queue.publish(JOB_SUBJECT, url.clone().into_bytes()).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = handler(&queue, prober()).handle(delivery).await.unwrap();

        let result = match outcome {
            JobOutcome::Completed(result) => result,
            other => panic!("expected a completed job, got {:?}", other),
        };
        assert_eq!(result.url, url);
        assert_eq!(result.status, 200);
        assert!(result.metrics.is_ordered());

        let published = results(&queue).await;
        assert_eq!(published, vec![result]);
        assert_eq!(queue.outstanding("worker_eu").await, 0);
        assert_eq!(target.hits(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_nacked_and_redelivered() {
        let url = refused_url().await;
        let queue = regional_queue();
        let mut deliveries = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();
        let handler = handler(&queue, prober());

        queue.publish(JOB_SUBJECT, url.into_bytes()).await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(handler.handle(first).await.unwrap(), JobOutcome::Nacked);

        let again = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .expect("job was not redelivered")
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count(), 2);
        assert!(results(&queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_payload_is_terminated() {
        let queue = regional_queue();
        let mut deliveries = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        let mut tracer = MockTracer::new();
        tracer.expect_trace().never();

        queue.publish(JOB_SUBJECT, vec![0xff, 0xfe, 0x00]).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = handler(&queue, Arc::new(tracer)).handle(delivery).await.unwrap();

        assert_eq!(outcome, JobOutcome::Terminated);
        assert_eq!(queue.outstanding("worker_eu").await, 0);
    }

    #[tokio::test]
    async fn test_probe_error_is_nacked_without_publishing() {
        let queue = regional_queue();
        let mut deliveries = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        let mut tracer = MockTracer::new();
        tracer.expect_trace().times(1).returning(|target| {
            Err(ProbeError::new(target, ProbeFailure::Timeout(Duration::from_secs(5))))
        });

        queue.publish(JOB_SUBJECT, b"https://example.com".to_vec()).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = handler(&queue, Arc::new(tracer)).handle(delivery).await.unwrap();

        assert_eq!(outcome, JobOutcome::Nacked);
        assert!(results(&queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_result_publish_failure_is_nacked() {
        // No results subject bound, so publishing the result fails.
        let queue = InMemoryQueue::with_subjects(["jobs.eu.*"]);
        let mut deliveries = queue.subscribe(&ConsumerSpec::for_region("eu")).await.unwrap();

        let mut tracer = MockTracer::new();
        tracer
            .expect_trace()
            .times(1)
            .returning(|target| Ok(sample(target)));

        queue.publish(JOB_SUBJECT, b"https://example.com".to_vec()).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = handler(&queue, Arc::new(tracer)).handle(delivery).await.unwrap();

        assert_eq!(outcome, JobOutcome::Nacked);
        assert_eq!(queue.outstanding("worker_eu").await, 1);
    }

    #[tokio::test]
    async fn test_worker_ignores_other_regions() {
        let queue = InMemoryQueue::with_subjects(["jobs.eu.*", "jobs.us.*", "jobs.results"]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tracer = MockTracer::new();
        tracer
            .expect_trace()
            .withf(|target| target.to_string() == "https://eu.example.com")
            .times(1)
            .returning(|target| Ok(sample(target)));

        let health = HealthState::new("eu");
        let worker = Worker::new(
            Arc::new(queue.clone()),
            handler(&queue, Arc::new(tracer)),
            ConsumerSpec::for_region("eu"),
            4,
            health.clone(),
        );

        queue.publish("jobs.us.trace", b"https://us.example.com".to_vec()).await.unwrap();
        queue.publish(JOB_SUBJECT, b"https://eu.example.com".to_vec()).await.unwrap();

        let running = tokio::spawn(async move { worker.run(shutdown_rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while results(&queue).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no result was published");
        assert!(health.is_ready().await);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();

        let published = results(&queue).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].url, "https://eu.example.com");
        assert_eq!(queue.outstanding("worker_eu").await, 0);
        assert!(!health.is_ready().await);
    }

    #[tokio::test]
    async fn test_worker_fails_when_consumer_cannot_be_created() {
        let queue = InMemoryQueue::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = HealthState::new("eu");

        let worker = Worker::new(
            Arc::new(queue.clone()),
            handler(&queue, Arc::new(MockTracer::new())),
            ConsumerSpec::for_region("eu"),
            1,
            health.clone(),
        );

        assert!(worker.run(shutdown_rx).await.is_err());
        assert!(!health.is_alive().await);
    }
}
