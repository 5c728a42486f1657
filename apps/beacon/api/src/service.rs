//! Validation and publishing of probe requests.

use crate::error::{IngressError, IngressResult};
use messaging::{JobQueue, RegionRegistry, RegionRoute};
use probe::{Target, TargetError};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

/// Body of `POST /v1/probe`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeRequest {
    #[serde(default)]
    pub region: Option<String>,
    /// `null` and absent both count as a missing target.
    #[serde(default)]
    pub target: Option<String>,
}

/// A job accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedJob {
    pub region: String,
    pub subject: String,
    pub target: String,
}

/// Validates probe requests and publishes them onto the region's subject.
///
/// Validation completes before anything is published: a rejected request never
/// reaches the queue.
#[derive(Clone)]
pub struct ProbeDispatcher {
    queue: Arc<dyn JobQueue>,
    registry: Arc<RegionRegistry>,
    default_region: String,
}

impl ProbeDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: RegionRegistry,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            default_region: default_region.into(),
        }
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    /// Check the target, then the region.
    pub fn validate(&self, request: &ProbeRequest) -> IngressResult<(Target, &RegionRoute)> {
        let raw = request.target.as_deref().ok_or(TargetError::Empty)?;
        let target = Target::parse(raw)?;

        let region = request
            .region
            .as_deref()
            .map(str::trim)
            .filter(|region| !region.is_empty())
            .unwrap_or(self.default_region.as_str());

        let route = self
            .registry
            .resolve(region)
            .ok_or_else(|| IngressError::UnknownRegion(region.to_string()))?;

        Ok((target, route))
    }

    #[instrument(skip(self, request), fields(target = ?request.target))]
    pub async fn dispatch(&self, request: ProbeRequest) -> IngressResult<DispatchedJob> {
        let (target, route) = self.validate(&request)?;

        self.queue
            .publish(&route.job_subject, target.as_str().as_bytes().to_vec())
            .await?;

        info!(region = %route.region, subject = %route.job_subject, "Probe job published");

        Ok(DispatchedJob {
            region: route.region.clone(),
            subject: route.job_subject.clone(),
            target: target.into_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::InMemoryQueue;

    fn dispatcher(queue: InMemoryQueue) -> ProbeDispatcher {
        let registry = RegionRegistry::from_regions(["eu", "us"]);
        ProbeDispatcher::new(Arc::new(queue), registry, "eu")
    }

    fn request(region: Option<&str>, target: &str) -> ProbeRequest {
        ProbeRequest {
            region: region.map(str::to_string),
            target: Some(target.to_string()),
        }
    }

    fn queue() -> InMemoryQueue {
        InMemoryQueue::with_subjects(["jobs.eu.*", "jobs.us.*", "jobs.results"])
    }

    #[tokio::test]
    async fn test_dispatch_publishes_raw_target() {
        let queue = queue();
        let dispatcher = dispatcher(queue.clone());

        let job = dispatcher
            .dispatch(request(Some("us"), " https://example.com "))
            .await
            .unwrap();

        assert_eq!(job.region, "us");
        assert_eq!(job.subject, "jobs.us.trace");

        let published = queue.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "jobs.us.trace");
        assert_eq!(published[0].payload, b"https://example.com");
    }

    #[tokio::test]
    async fn test_missing_or_blank_region_uses_default() {
        let queue = queue();
        let dispatcher = dispatcher(queue.clone());

        dispatcher
            .dispatch(request(None, "https://example.com"))
            .await
            .unwrap();
        dispatcher
            .dispatch(request(Some("  "), "https://example.com"))
            .await
            .unwrap();

        let published = queue.published().await;
        assert!(published.iter().all(|m| m.subject == "jobs.eu.trace"));
        assert_eq!(published.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_target_wins_over_unknown_region() {
        let queue = queue();
        let dispatcher = dispatcher(queue.clone());

        let err = dispatcher
            .dispatch(request(Some("xx"), "not a url"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::InvalidTarget(_)));
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_region_is_rejected() {
        let queue = queue();
        let dispatcher = dispatcher(queue.clone());

        let err = dispatcher
            .dispatch(request(Some("xx"), "https://example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::UnknownRegion(ref region) if region == "xx"));
        assert!(queue.published().await.is_empty());
    }

    #[test]
    fn test_absent_target_is_empty() {
        let dispatcher = dispatcher(queue());
        let request = ProbeRequest {
            region: Some("eu".to_string()),
            target: None,
        };

        let err = dispatcher.validate(&request).unwrap_err();
        assert!(matches!(err, IngressError::InvalidTarget(TargetError::Empty)));
    }
}
