//! NATS JetStream backend.
//!
//! ```text
//! ┌──────────────┐  jobs.<region>.trace  ┌──────────────────┐  worker_<region>  ┌──────────┐
//! │ beacon_api   │──────────────────────▶│  stream "jobs"   │──────────────────▶│  worker  │
//! └──────────────┘                       │ jobs.<region>.*  │                   └────┬─────┘
//!        ▲            API_RESULTS        │ jobs.results     │   jobs.results         │
//!        └───────────────────────────────│                  │◀───────────────────────┘
//!                                        └──────────────────┘
//! ```

mod queue;

pub use queue::{NatsAcker, NatsQueue};
