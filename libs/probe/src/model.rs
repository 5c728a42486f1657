//! Trace results as published on `jobs.results`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Phase timings of one probe. Absent phases are zero.
///
/// Serialized with the wire names consumers of `jobs.results` expect and
/// durations as integer nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "dns_duration", with = "nanos")]
    pub dns: Duration,
    #[serde(rename = "con_duration", with = "nanos")]
    pub connect: Duration,
    #[serde(rename = "tls_duration", with = "nanos")]
    pub tls: Duration,
    /// From the start of the probe until response headers arrived.
    #[serde(rename = "tt_first_byte", with = "nanos")]
    pub time_to_first_byte: Duration,
    /// From the start of the probe until the body was fully read.
    #[serde(rename = "total_duration", with = "nanos")]
    pub total: Duration,
}

impl Metrics {
    /// `dns, connect, tls <= time_to_first_byte <= total`.
    pub fn is_ordered(&self) -> bool {
        let phases_before_first_byte = [self.dns, self.connect, self.tls]
            .iter()
            .all(|phase| *phase <= self.time_to_first_byte);
        phases_before_first_byte && self.time_to_first_byte <= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResult {
    pub url: String,
    pub status: u16,
    pub metrics: Metrics,
}

impl TraceResult {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TraceResult {
        TraceResult {
            url: "https://example.com".to_string(),
            status: 200,
            metrics: Metrics {
                dns: Duration::from_millis(3),
                connect: Duration::from_millis(10),
                tls: Duration::from_millis(25),
                time_to_first_byte: Duration::from_millis(80),
                total: Duration::from_millis(95),
            },
        }
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(sample()).unwrap();

        assert_eq!(
            value,
            json!({
                "url": "https://example.com",
                "status": 200,
                "metrics": {
                    "dns_duration": 3_000_000u64,
                    "con_duration": 10_000_000u64,
                    "tls_duration": 25_000_000u64,
                    "tt_first_byte": 80_000_000u64,
                    "total_duration": 95_000_000u64
                }
            })
        );
    }

    #[test]
    fn test_from_json() {
        let bytes = sample().to_json().unwrap();
        assert_eq!(TraceResult::from_json(&bytes).unwrap(), sample());

        assert!(TraceResult::from_json(b"{\"url\": \"x\"}").is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(sample().metrics.is_ordered());
        assert!(Metrics::default().is_ordered());

        let broken = Metrics {
            tls: Duration::from_millis(90),
            ..sample().metrics
        };
        assert!(!broken.is_ordered());
    }
}
