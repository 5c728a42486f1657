//! Probe target URLs.

use http::uri::{Scheme, Uri};
use std::fmt;
use thiserror::Error;

/// Why a string is not an acceptable probe target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target is empty")]
    Empty,

    #[error("target is not a valid URI: {0}")]
    Malformed(String),

    #[error("target must be an absolute http or https URL")]
    NotAbsolute,

    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("target has no host")]
    MissingHost,
}

/// An absolute `http`/`https` URL with a host.
///
/// Keeps the trimmed input verbatim so that what the caller sent is what
/// travels on the queue and what appears in the trace result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    raw: String,
    uri: Uri,
    secure: bool,
}

impl Target {
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(TargetError::Empty);
        }

        let uri: Uri = raw
            .parse()
            .map_err(|e: http::uri::InvalidUri| TargetError::Malformed(e.to_string()))?;

        let secure = match uri.scheme() {
            Some(scheme) if *scheme == Scheme::HTTPS => true,
            Some(scheme) if *scheme == Scheme::HTTP => false,
            Some(other) => return Err(TargetError::UnsupportedScheme(other.to_string())),
            None => return Err(TargetError::NotAbsolute),
        };

        match uri.host() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(TargetError::MissingHost),
        }

        Ok(Self {
            raw: raw.to_string(),
            uri,
            secure,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host to resolve and dial, without IPv6 brackets.
    pub fn host(&self) -> &str {
        self.uri
            .host()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or(if self.secure { 443 } else { 80 })
    }

    /// Value of the `Host` header (`host[:port]`, no userinfo).
    pub fn host_header(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        match self.uri.port_u16() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Origin-form request target.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_https_defaults() {
        let target = Target::parse("  https://example.com  ").unwrap();

        assert_eq!(target.as_str(), "https://example.com");
        assert!(target.is_secure());
        assert_eq!(target.host(), "example.com");
        assert_eq!(target.port(), 443);
        assert_eq!(target.host_header(), "example.com");
        assert_eq!(target.path_and_query(), "/");
    }

    #[test]
    fn test_parse_http_with_port_path_and_query() {
        let target = Target::parse("http://127.0.0.1:8080/status?verbose=1").unwrap();

        assert!(!target.is_secure());
        assert_eq!(target.host(), "127.0.0.1");
        assert_eq!(target.port(), 8080);
        assert_eq!(target.host_header(), "127.0.0.1:8080");
        assert_eq!(target.path_and_query(), "/status?verbose=1");
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let target = Target::parse("http://[::1]:9000/").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.host_header(), "[::1]:9000");
    }

    #[test]
    fn test_rejects_invalid_targets() {
        assert_eq!(Target::parse(""), Err(TargetError::Empty));
        assert_eq!(Target::parse("   "), Err(TargetError::Empty));
        assert_eq!(Target::parse("/relative/path"), Err(TargetError::NotAbsolute));
        assert_eq!(Target::parse("example.com"), Err(TargetError::NotAbsolute));
        assert!(matches!(
            Target::parse("ftp://example.com"),
            Err(TargetError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            Target::parse("not a url"),
            Err(TargetError::Malformed(_))
        ));
    }
}
