//! Region-addressed probe job queue.
//!
//! Jobs for a region travel on `jobs.<region>.trace` and are consumed by the
//! durable `worker_<region>` consumer filtered on `jobs.<region>.*`. Workers
//! publish results on `jobs.results`. The stream's subject list is the source
//! of truth for which regions exist.
//!
//! Two backends implement [`JobQueue`]:
//!
//! - [`NatsQueue`] (feature `nats`): JetStream durable pull consumers
//! - [`InMemoryQueue`]: process-local broker for tests and `memory://`
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{ConsumerSpec, JobQueue, RegionRegistry};
//!
//! let queue = messaging::connect(&nats_config).await?;
//! let registry = RegionRegistry::from_subjects(queue.provisioned_subjects().await?);
//!
//! let route = registry.resolve("eu").ok_or("unknown region")?;
//! queue.publish(&route.job_subject, b"https://example.com".to_vec()).await?;
//!
//! let mut deliveries = queue.subscribe(&ConsumerSpec::for_region("eu")).await?;
//! ```

mod consumer;
mod error;
pub mod memory;
mod queue;
mod registry;
pub mod subject;

#[cfg(feature = "nats")]
pub mod nats;

pub use consumer::{ConsumerSpec, DEFAULT_ACK_WAIT, DEFAULT_MAX_ACK_PENDING, UNLIMITED_DELIVERIES};
pub use error::QueueError;
pub use memory::{InMemoryQueue, StoredMessage};
pub use queue::{Acker, Delivery, DeliveryStream, JobQueue};
pub use registry::{RegionRegistry, RegionRoute};

#[cfg(feature = "nats")]
pub use nats::NatsQueue;

use core_config::nats::NatsConfig;
use std::sync::Arc;

/// Open the backend selected by `config.url`.
///
/// `memory://` yields a fresh process-local broker; anything else is treated
/// as a NATS server URL.
pub async fn connect(config: &NatsConfig) -> Result<Arc<dyn JobQueue>, QueueError> {
    if config.is_memory() {
        tracing::warn!("Using the in-memory broker, jobs do not leave this process");
        return Ok(Arc::new(InMemoryQueue::new()));
    }

    #[cfg(feature = "nats")]
    {
        let queue = NatsQueue::connect(config).await?;
        Ok(Arc::new(queue))
    }

    #[cfg(not(feature = "nats"))]
    {
        Err(QueueError::Connect {
            url: config.url.clone(),
            message: "built without the `nats` feature".to_string(),
        })
    }
}
