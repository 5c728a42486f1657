//! Configuration for the probe ingress

use core_config::nats::NatsConfig;
use core_config::server::ServerConfig;
use core_config::{env_list, env_or_default, ConfigError, Environment, FromEnv};
use messaging::subject::is_literal_token;

pub const DEFAULT_REGION: &str = "eu";
pub const DEFAULT_RESULTS_DURABLE: &str = "API_RESULTS";

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub nats: NatsConfig,
    /// Region used when a probe request omits one.
    pub default_region: String,
    /// Durable consumer name of the result sink on `jobs.results`.
    pub results_durable: String,
    /// Regions to bind to the jobs stream at startup. Empty means the stream
    /// is provisioned externally and only read.
    pub provision_regions: Vec<String>,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_env();
        let server = ServerConfig::from_env()?;

        let mut nats = NatsConfig::from_env()?;
        if nats.connection_name.is_none() {
            nats = nats.with_connection_name(env!("CARGO_PKG_NAME"));
        }

        let default_region = token("DEFAULT_REGION", env_or_default("DEFAULT_REGION", DEFAULT_REGION))?;
        let results_durable = token(
            "RESULTS_DURABLE",
            env_or_default("RESULTS_DURABLE", DEFAULT_RESULTS_DURABLE),
        )?;

        let provision_regions = env_list("PROVISION_REGIONS")
            .into_iter()
            .map(|region| token("PROVISION_REGIONS", region))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            environment,
            server,
            nats,
            default_region,
            results_durable,
            provision_regions,
        })
    }
}

fn token(key: &str, value: String) -> Result<String, ConfigError> {
    let value = value.trim().to_string();
    if is_literal_token(&value) {
        Ok(value)
    } else {
        Err(ConfigError::ParseError {
            key: key.to_string(),
            details: format!("'{}' is not a valid subject token", value),
        })
    }
}
