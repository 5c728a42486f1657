//! Subject naming for the probe job hierarchy.
//!
//! ```text
//! jobs.<region>.<kind>    job published by the ingress   (e.g. jobs.eu.trace)
//! jobs.<region>.*         filter of the region's durable consumer
//! jobs.results            trace results published by the workers
//! ```

/// Root token of every job subject.
pub const JOBS_ROOT: &str = "jobs";

/// Fixed subject the workers publish trace results to.
pub const RESULTS_SUBJECT: &str = "jobs.results";

/// Last token of subjects the ingress publishes probe jobs on.
pub const TRACE_JOB_KIND: &str = "trace";

/// Prefix of the durable consumer name bound to a region.
pub const WORKER_DURABLE_PREFIX: &str = "worker_";

/// Wildcard filter covering every job of `region` (`jobs.<region>.*`).
pub fn region_filter(region: &str) -> String {
    format!("{}.{}.*", JOBS_ROOT, region)
}

/// Concrete subject a job of `kind` for `region` is published on.
pub fn job_subject(region: &str, kind: &str) -> String {
    format!("{}.{}.{}", JOBS_ROOT, region, kind)
}

/// Durable consumer name shared by every worker of `region`.
pub fn worker_durable(region: &str) -> String {
    format!("{}{}", WORKER_DURABLE_PREFIX, region)
}

/// Extract the region from a `jobs.<region>.*` filter.
///
/// Returns `None` for anything else, including `jobs.results` and filters
/// with wildcards in the region position.
pub fn region_of_filter(filter: &str) -> Option<&str> {
    let mut tokens = filter.split('.');
    let (root, region, tail) = (tokens.next()?, tokens.next()?, tokens.next()?);
    if tokens.next().is_some() || root != JOBS_ROOT || tail != "*" {
        return None;
    }
    is_literal_token(region).then_some(region)
}

/// A single subject token without wildcards, separators or whitespace.
pub fn is_literal_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

/// A subject that may be published to: dot-separated literal tokens only.
pub fn is_publishable(subject: &str) -> bool {
    subject.split('.').all(is_literal_token)
}

/// NATS subject matching: `*` matches exactly one token, a trailing `>`
/// matches one or more remaining tokens.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
