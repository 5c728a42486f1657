//! Broker connection settings shared by the ingress API and the workers.

use crate::{env_or_default, ConfigError, FromEnv};

pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_JOBS_STREAM: &str = "jobs";

/// URL scheme selecting the process-local broker instead of a NATS server.
pub const MEMORY_URL: &str = "memory://";

/// NATS / JetStream connection configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatsConfig {
    /// Server URL, or `memory://` for the in-process broker.
    pub url: String,
    /// JetStream stream holding both the region job subjects and the results subject.
    pub stream: String,
    /// Client connection name reported to the server.
    pub connection_name: Option<String>,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
            connection_name: None,
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// True when the URL selects the in-process broker.
    pub fn is_memory(&self) -> bool {
        self.url.starts_with(MEMORY_URL)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new(DEFAULT_NATS_URL, DEFAULT_JOBS_STREAM)
    }
}

impl FromEnv for NatsConfig {
    /// - NATS_URL: defaults to nats://localhost:4222
    /// - JOBS_STREAM: defaults to "jobs"
    /// - NATS_CONNECTION_NAME: optional
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_or_default("NATS_URL", DEFAULT_NATS_URL);
        let stream = env_or_default("JOBS_STREAM", DEFAULT_JOBS_STREAM);

        if stream.trim().is_empty() || stream.contains(['.', '*', '>', ' ']) {
            return Err(ConfigError::ParseError {
                key: "JOBS_STREAM".to_string(),
                details: format!("'{}' is not a valid stream name", stream),
            });
        }

        let connection_name = std::env::var("NATS_CONNECTION_NAME")
            .ok()
            .filter(|name| !name.trim().is_empty());

        Ok(Self {
            url,
            stream,
            connection_name,
        })
    }
}
