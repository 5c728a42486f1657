use crate::TargetError;
use std::time::Duration;
use thiserror::Error;

/// A failed probe, carrying the target it was aimed at.
#[derive(Debug, Error)]
#[error("probe of '{target}' failed: {failure}")]
pub struct ProbeError {
    pub target: String,
    pub failure: ProbeFailure,
}

impl ProbeError {
    pub fn new(target: impl Into<String>, failure: ProbeFailure) -> Self {
        Self {
            target: target.into(),
            failure,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, ProbeFailure::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("{0}")]
    InvalidTarget(#[from] TargetError),

    #[error("dns lookup failed: {0}")]
    Dns(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("http exchange failed: {0}")]
    Http(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ProbeFailure {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTarget(_) => "invalid_target",
            Self::Dns(_) => "dns",
            Self::Connect(_) => "connect",
            Self::Tls(_) => "tls",
            Self::Http(_) => "http",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// The prober could not be constructed.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("tls configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}
