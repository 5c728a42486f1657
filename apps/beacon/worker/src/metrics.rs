//! Prometheus metrics for the probe worker.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Counters and histograms labelled with the worker's region.
#[derive(Clone)]
pub struct WorkerMetrics {
    region: String,
}

impl WorkerMetrics {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    pub fn job_received(&self) {
        counter!(
            "beacon_worker_jobs_received_total",
            "region" => self.region.clone()
        )
        .increment(1);
    }

    /// Record a probe that produced a result, whatever its HTTP status.
    pub fn probe_succeeded(&self, total: Duration) {
        counter!(
            "beacon_worker_probes_succeeded_total",
            "region" => self.region.clone()
        )
        .increment(1);

        histogram!(
            "beacon_worker_probe_duration_seconds",
            "region" => self.region.clone()
        )
        .record(total.as_secs_f64());
    }

    pub fn probe_failed(&self, kind: &'static str) {
        counter!(
            "beacon_worker_probes_failed_total",
            "region" => self.region.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn job_nacked(&self) {
        counter!(
            "beacon_worker_jobs_nacked_total",
            "region" => self.region.clone()
        )
        .increment(1);
    }

    pub fn job_terminated(&self) {
        counter!(
            "beacon_worker_jobs_terminated_total",
            "region" => self.region.clone()
        )
        .increment(1);
    }
}

/// Install the global Prometheus recorder.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
