//! Phase-timed HTTP probes.
//!
//! A [`Prober`] issues a single cache-defeating `GET` against a target URL and
//! reports how long each phase took (DNS, TCP connect, TLS, time to first
//! byte, total) as a [`TraceResult`]. Every failure mode, including the
//! overall timeout, surfaces as one [`ProbeError`] carrying the target.
//!
//! ```rust,ignore
//! let prober = Prober::new(probe::DEFAULT_TIMEOUT)?;
//! let result = prober.probe("https://example.com").await?;
//! println!("{} answered {} in {:?}", result.url, result.status, result.metrics.total);
//! ```

mod error;
mod model;
mod prober;
pub mod recorder;
mod target;

pub use error::{ProbeError, ProbeFailure, SetupError};
pub use model::{Metrics, TraceResult};
pub use prober::{Prober, Tracer, DEFAULT_TIMEOUT};
pub use recorder::{TraceEvent, TraceRecorder};
pub use target::{Target, TargetError};
