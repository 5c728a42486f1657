//! Configuration for the probe worker

use clap::Parser;
use core_config::nats::NatsConfig;
use core_config::{env_parse_opt, env_parse_or, ConfigError, Environment, FromEnv};
use messaging::subject::is_literal_token;
use messaging::{ConsumerSpec, UNLIMITED_DELIVERIES};
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_ACK_WAIT_SECS: u64 = 30;
pub const DEFAULT_MAX_ACK_PENDING: i64 = 64;
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Command line of the worker binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "beacon_worker", version, about = "Regional probe worker")]
pub struct Args {
    /// Region to serve, e.g. `eu`
    #[arg(value_name = "REGION", env = "REGION", required_unless_present = "region_flag")]
    pub region: Option<String>,

    /// Region to serve (alternative to the positional argument)
    #[arg(long = "region", id = "region_flag", value_name = "REGION", conflicts_with = "region")]
    pub region_flag: Option<String>,
}

impl Args {
    fn region(&self) -> Option<&str> {
        self.region.as_deref().or(self.region_flag.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub nats: NatsConfig,
    pub region: String,
    /// Bound on a single probe, from first DNS query to last body byte.
    pub probe_timeout: Duration,
    pub ack_wait: Duration,
    /// Broker-side in-flight limit, also the size of the local task pool.
    pub max_ack_pending: i64,
    /// `-1` redelivers forever.
    pub max_deliver: i64,
    /// Delay before a nacked job becomes eligible again; `None` is immediate.
    pub nak_delay: Option<Duration>,
    pub health_port: u16,
}

impl Config {
    /// Combine the command line with the environment.
    ///
    /// - NATS_URL, JOBS_STREAM, NATS_CONNECTION_NAME (see `NatsConfig`)
    /// - PROBE_TIMEOUT_MS: defaults to 5000
    /// - ACK_WAIT_SECS: defaults to 30
    /// - MAX_ACK_PENDING: defaults to 64, must be positive
    /// - MAX_DELIVER: defaults to -1 (unlimited)
    /// - NAK_DELAY_MS: unset means immediate redelivery
    /// - HEALTH_PORT: defaults to 8081
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let region = args
            .region()
            .map(str::trim)
            .ok_or_else(|| ConfigError::MissingEnvVar("REGION".to_string()))?
            .to_string();
        if !is_literal_token(&region) {
            return Err(ConfigError::ParseError {
                key: "REGION".to_string(),
                details: format!("'{}' is not a valid region", region),
            });
        }

        let mut nats = NatsConfig::from_env()?;
        if nats.connection_name.is_none() {
            nats = nats.with_connection_name(format!("{}-{}", env!("CARGO_PKG_NAME"), region));
        }

        let max_ack_pending = env_parse_or("MAX_ACK_PENDING", DEFAULT_MAX_ACK_PENDING)?;
        if max_ack_pending < 1 {
            return Err(ConfigError::ParseError {
                key: "MAX_ACK_PENDING".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            environment: Environment::from_env(),
            nats,
            region,
            probe_timeout: Duration::from_millis(env_parse_or(
                "PROBE_TIMEOUT_MS",
                DEFAULT_PROBE_TIMEOUT_MS,
            )?),
            ack_wait: Duration::from_secs(env_parse_or("ACK_WAIT_SECS", DEFAULT_ACK_WAIT_SECS)?),
            max_ack_pending,
            max_deliver: env_parse_or("MAX_DELIVER", UNLIMITED_DELIVERIES)?,
            nak_delay: env_parse_opt::<u64>("NAK_DELAY_MS")?.map(Duration::from_millis),
            health_port: env_parse_or("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
        })
    }

    /// `worker_<region>` on `jobs.<region>.*` with the configured tuning.
    pub fn consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec::for_region(&self.region)
            .with_ack_wait(self.ack_wait)
            .with_max_ack_pending(self.max_ack_pending)
            .with_max_deliver(self.max_deliver)
    }

    /// Local task pool size.
    pub fn concurrency(&self) -> usize {
        usize::try_from(self.max_ack_pending).unwrap_or(1).max(1)
    }
}
