//! Shared test utilities for the beacon crates
//!
//! - `TestTarget`: local HTTP or HTTPS server to probe (always available)
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_utils::TestTarget;
//!
//! # async fn example() {
//! let target = TestTarget::start().await;
//! let url = target.url("/");
//! # }
//! ```
//!
//! ## NATS Testing
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```

mod http;

#[cfg(feature = "nats")]
mod nats;

pub use http::{refused_url, TestTarget, LARGE_BODY_LEN, SLOW_RESPONSE, TARGET_BODY};

#[cfg(feature = "nats")]
pub use nats::TestNats;
