//! Helpers for tests that need a live Redis server.
//!
//! The server location comes from `REDIS_HOST` / `REDIS_PORT`. Each helper
//! returns `None` when nothing answers so the calling test can skip.

use std::time::Duration;

use gopro_core::{Config, RedisConfig};
use uuid::Uuid;

use crate::client::RedisClient;

/// A fresh `test:{uuid}:` namespace so tests never share keys.
pub fn test_prefix() -> String {
    format!("test:{}:", Uuid::new_v4())
}

/// Configuration pointing at the test server under a unique prefix.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.redis = RedisConfig {
        host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379),
        prefix: test_prefix(),
        pool_size: 8,
        min_idle_conns: 1,
        max_retries: 0,
        dial_timeout: Duration::from_millis(500),
        ..RedisConfig::default()
    };
    config
}

/// Skip test if Redis not available.
pub async fn get_test_client() -> Option<RedisClient> {
    RedisClient::connect(&test_config().redis).await.ok()
}

/// Same as [`get_test_client`], also returning the config it was built from.
pub async fn get_test_setup() -> Option<(RedisClient, Config)> {
    let config = test_config();
    let client = RedisClient::connect(&config.redis).await.ok()?;
    Some((client, config))
}
