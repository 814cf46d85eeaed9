//! Redis keyed cache.
//!
//! Every key is namespaced with the process-wide prefix on the way in and
//! stripped of it on the way out. Values are stored as text; the typed
//! [`gopro_core::CacheExt`] methods encode them as JSON.

use std::time::Duration;

use async_trait::async_trait;

use gopro_core::{Cache, CacheError, KeySpace, KeyTtl, Result};

use crate::client::RedisClient;

const DELETE_BATCH: usize = 500;

/// Redis cache backend over the shared pool.
#[derive(Clone)]
pub struct RedisCache {
    client: RedisClient,
    keys: KeySpace,
}

impl RedisCache {
    pub fn new(client: RedisClient) -> Self {
        let keys = client.key_space("");
        Self { client, keys }
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    fn strip_all(&self, keys: Vec<String>) -> Vec<String> {
        keys.into_iter()
            .map(|k| self.keys.strip(&k).to_string())
            .collect()
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<String> {
        let full = self.keys.key(key);
        self.client
            .get(&full)
            .await?
            .ok_or_else(|| CacheError::miss(full))
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.client.set(&self.keys.key(key), value, ttl).await
    }

    async fn set_nx_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.client.set_nx(&self.keys.key(key), value, ttl).await
    }

    async fn get_set_raw(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.client.get_set(&self.keys.key(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.del(&[self.keys.key(key)]).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.client.exists(&self.keys.key(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.client.expire(&self.keys.key(key), ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.client.ttl(&self.keys.key(key)).await
    }

    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.client.incr_by(&self.keys.key(key), delta).await
    }

    async fn decrement_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.client.decr_by(&self.keys.key(key), delta).await
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        self.client.mget(&self.keys.keys(keys)).await
    }

    async fn mset(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let pairs: Vec<(String, &str)> = pairs
            .iter()
            .map(|(key, value)| (self.keys.key(key), *value))
            .collect();
        self.client.mset(&pairs).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let found = self.client.keys(&self.keys.pattern(pattern)).await?;
        Ok(self.strip_all(found))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let (next, found) = self
            .client
            .scan(cursor, &self.keys.pattern(pattern), count)
            .await?;
        Ok((next, self.strip_all(found)))
    }

    async fn scan_all(&self, pattern: &str) -> Result<Vec<String>> {
        let found = self.client.scan_all(&self.keys.pattern(pattern)).await?;
        Ok(self.strip_all(found))
    }

    async fn flush_pattern(&self, pattern: &str) -> Result<u64> {
        // Scanned keys are already prefixed and are deleted as-is.
        let found = self.client.scan_all(&self.keys.pattern(pattern)).await?;
        let mut deleted = 0;
        for batch in found.chunks(DELETE_BATCH) {
            deleted += self.client.del(batch).await?;
        }
        tracing::debug!(pattern, deleted, "flushed keys by pattern");
        Ok(deleted)
    }

    async fn flush_db(&self) -> Result<()> {
        self.client.flushdb().await
    }

    async fn health_check(&self) -> Result<()> {
        self.client.ping().await
    }

    async fn close(&self) -> Result<()> {
        self.client.close();
        Ok(())
    }
}
