//! Error types for the job queue.

use thiserror::Error;

/// Errors raised by a [`JobQueue`](crate::JobQueue) backend.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to broker at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("stream '{stream}' error: {message}")]
    Stream { stream: String, message: String },

    #[error("consumer '{durable}' error: {message}")]
    Consumer { durable: String, message: String },

    #[error("failed to publish to '{subject}': {message}")]
    Publish { subject: String, message: String },

    #[error("failed to settle delivery: {0}")]
    Ack(String),

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("broker connection is closed")]
    Closed,
}

impl QueueError {
    pub fn stream(stream: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Stream {
            stream: stream.into(),
            message: error.to_string(),
        }
    }

    pub fn consumer(durable: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Consumer {
            durable: durable.into(),
            message: error.to_string(),
        }
    }

    pub fn publish(subject: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: error.to_string(),
        }
    }

    /// Whether the broker itself could not be reached or refused the operation,
    /// as opposed to a caller mistake such as a malformed subject.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, Self::InvalidSubject(_))
    }
}
