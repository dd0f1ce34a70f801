// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides a Redis container standing in for the partitioned log.

use cdc_replication::resilience::RetryPolicy;
use cdc_replication::{RedisTransport, TransportConfig};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis log shared by the clusters of one test.
pub struct TestLog<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestLog<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self { container, redis_url }
    }

    pub fn config(&self) -> TransportConfig {
        TransportConfig::for_testing(&self.redis_url)
    }

    pub async fn transport(&self) -> RedisTransport {
        RedisTransport::connect(self.config(), &RetryPolicy::testing())
            .await
            .expect("Failed to connect to Redis")
    }

    /// Entries in one partition stream, read directly.
    pub async fn stream_len(&self, key: &str) -> redis::RedisResult<usize> {
        use redis::AsyncCommands;
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        conn.xlen(key).await
    }
}
