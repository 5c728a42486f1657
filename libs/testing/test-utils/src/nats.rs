//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that starts a NATS container with JetStream.

use async_nats::Client;
use async_nats::jetstream::{self, stream};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
/// nats.jobs_stream("jobs", &["eu", "us"]).await;
/// let url = nats.connection_string();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Start NATS (latest image) with JetStream enabled.
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client (useful for passing to services)
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Create `name` bound to `jobs.<region>.*` for each region plus `jobs.results`.
    pub async fn jobs_stream(&self, name: &str, regions: &[&str]) -> stream::Stream {
        let subjects = regions
            .iter()
            .map(|region| format!("jobs.{}.*", region))
            .chain(std::iter::once("jobs.results".to_string()))
            .collect();

        self.jetstream()
            .create_stream(stream::Config {
                name: name.to_string(),
                subjects,
                ..Default::default()
            })
            .await
            .expect("Failed to create jobs stream")
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}
