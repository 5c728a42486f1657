//! Durable consumer definitions.

use crate::subject;
use std::time::Duration;

pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ACK_PENDING: i64 = 64;

/// Unlimited redelivery, the broker default.
pub const UNLIMITED_DELIVERIES: i64 = -1;

/// Durable pull consumer registered (create-or-update) on the jobs stream.
///
/// Every process passing the same `durable_name` joins the same competing
/// consumer group: each message is leased to exactly one member at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    pub durable_name: String,
    pub description: Option<String>,
    pub filter_subject: String,
    /// How long a delivery may stay unacknowledged before it is redelivered.
    pub ack_wait: Duration,
    /// Maximum unacknowledged deliveries across the whole group.
    pub max_ack_pending: i64,
    /// Maximum delivery attempts per message, `-1` for no limit.
    pub max_deliver: i64,
}

impl ConsumerSpec {
    pub fn new(durable_name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        let durable_name = durable_name.into();
        Self {
            name: durable_name.clone(),
            durable_name,
            description: None,
            filter_subject: filter_subject.into(),
            ack_wait: DEFAULT_ACK_WAIT,
            max_ack_pending: DEFAULT_MAX_ACK_PENDING,
            max_deliver: UNLIMITED_DELIVERIES,
        }
    }

    /// `worker_<region>` filtered on `jobs.<region>.*`.
    pub fn for_region(region: &str) -> Self {
        Self::new(subject::worker_durable(region), subject::region_filter(region))
            .with_description(format!("Worker for tracing jobs in {}", region))
    }

    /// Durable subscription on the results subject.
    pub fn for_results(durable_name: impl Into<String>) -> Self {
        Self::new(durable_name, subject::RESULTS_SUBJECT)
            .with_description("Trace result sink".to_string())
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: i64) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Whether a message delivered `delivered` times may be offered again.
    pub fn allows_redelivery(&self, delivered: u64) -> bool {
        self.max_deliver <= 0 || delivered < self.max_deliver as u64
    }
}
