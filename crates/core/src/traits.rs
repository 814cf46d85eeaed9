use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::Result,
    lock::{LockInfo, LockToken},
    pubsub::Subscription,
    ratelimit::{RateLimitInfo, TokenBucketDecision},
    serialization::{decode, encode},
    session::SessionData,
    ttl::KeyTtl,
};

/// Namespaced key/value cache.
///
/// Keys passed in and returned are unprefixed. A `ttl` of `None` or zero
/// means no expiration.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Reads the stored text. Fails with `Miss` when absent.
    async fn get_raw(&self, key: &str) -> Result<String>;

    async fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the value was written.
    async fn set_nx_raw(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Writes `value` and returns the previous text, if any.
    async fn get_set_raw(&self, key: &str, value: &str) -> Result<Option<String>>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn increment(&self, key: &str) -> Result<i64> {
        self.increment_by(key, 1).await
    }

    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn decrement(&self, key: &str) -> Result<i64> {
        self.decrement_by(key, 1).await
    }

    async fn decrement_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Values aligned with `keys`.
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>>;

    async fn mset(&self, pairs: &[(&str, &str)]) -> Result<()>;

    /// Blocking, unbounded enumeration. Prefer [`Cache::scan`].
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// One `SCAN` step. Returns the next cursor (0 when done) and a page of keys.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    async fn scan_all(&self, pattern: &str) -> Result<Vec<String>>;

    /// Deletes every key whose unprefixed name matches `pattern`.
    async fn flush_pattern(&self, pattern: &str) -> Result<u64>;

    async fn flush_db(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Typed cache access with JSON encoding.
#[async_trait]
pub trait CacheExt: Cache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<T> {
        let text = self.get_raw(key).await?;
        decode(&text)
    }

    async fn set<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let text = encode(value)?;
        self.set_raw(key, &text, ttl).await
    }

    async fn set_nx<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let text = encode(value)?;
        self.set_nx_raw(key, &text, ttl).await
    }

    async fn get_set<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<Option<String>> {
        let text = encode(value)?;
        self.get_set_raw(key, &text).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Session records indexed by id and by user id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates or replaces a session. A zero `ttl` uses the configured default.
    async fn create_session(&self, id: &str, data: SessionData, ttl: Duration) -> Result<()>;

    /// Returns the flat session mapping. Fails with `SessionNotFound`.
    async fn get_session(&self, id: &str) -> Result<SessionData>;

    /// Read-merge-write; concurrent updates may lose fields.
    async fn update_session(&self, id: &str, patch: SessionData) -> Result<()>;

    async fn delete_session(&self, id: &str) -> Result<()>;

    async fn refresh_session(&self, id: &str, ttl: Duration) -> Result<()>;

    /// Live session ids of a user. Stale index entries are removed.
    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<String>>;

    /// Returns the number of sessions deleted.
    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64>;

    async fn session_count(&self) -> Result<u64>;

    async fn cleanup_expired_sessions(&self) -> Result<u64>;
}

/// At-most-one holder per key.
///
/// A zero `ttl` uses the configured default timeout.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns the token when acquired, `None` when already held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    async fn lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.acquire(key, ttl).await?.is_some())
    }

    async fn lock_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        delay: Duration,
    ) -> Result<LockToken>;

    /// Deletes the lock if it exists, whoever holds it.
    ///
    /// Prefer [`DistributedLock::unlock_with_value`].
    async fn unlock(&self, key: &str) -> Result<()>;

    /// Deletes the lock only if it holds `token`.
    async fn unlock_with_value(&self, key: &str, token: &LockToken) -> Result<()>;

    /// Resets the expiry if the lock exists, whoever holds it.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn extend_with_value(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<()>;

    async fn is_locked(&self, key: &str) -> Result<bool>;

    async fn lock_ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn lock_info(&self, key: &str) -> Result<LockInfo>;

    async fn cleanup_expired_locks(&self) -> Result<u64>;
}

/// Sliding-window and token-bucket admission.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<bool> {
        self.allow_n(key, limit, window, 1).await
    }

    async fn allow_n(&self, key: &str, limit: u64, window: Duration, n: u64) -> Result<bool> {
        Ok(self.allow_with_info(key, limit, window, n).await?.allowed)
    }

    async fn allow_with_info(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        n: u64,
    ) -> Result<RateLimitInfo>;

    /// Requests still admissible in the current window. Does not record a request.
    async fn remaining(&self, key: &str, limit: u64, window: Duration) -> Result<u64> {
        Ok(self.info(key, limit, window).await?.remaining)
    }

    /// Read-only view of the current window.
    async fn info(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitInfo>;

    async fn reset(&self, key: &str) -> Result<()>;

    async fn token_bucket_allow(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
        requested: u64,
    ) -> Result<TokenBucketDecision>;

    /// Returns the number of keys touched.
    async fn cleanup_expired_rate_limits(&self) -> Result<u64>;
}

/// Prefixed publish/subscribe.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns the number of receivers.
    async fn publish_string(&self, channel: &str, payload: &str) -> Result<u64>;

    async fn publish_bytes(&self, channel: &str, payload: &[u8]) -> Result<u64>;

    /// Publishes every pair in one round trip.
    async fn bulk_publish(&self, messages: &[(&str, &str)]) -> Result<()>;

    /// Fails with `InvalidArgument` when `channels` is empty.
    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription>;

    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription>;

    /// Removes the channels from every live subscription.
    async fn unsubscribe(&self, channels: &[&str]) -> Result<()>;

    async fn punsubscribe(&self, patterns: &[&str]) -> Result<()>;

    async fn list_channels(&self, pattern: &str) -> Result<Vec<String>>;

    async fn channel_subscribers(&self, channel: &str) -> Result<u64>;

    /// Messages dropped because a consumer's queue was full.
    fn dropped_messages(&self) -> u64;

    async fn close(&self) -> Result<()>;
}

/// Typed publishing with JSON encoding.
#[async_trait]
pub trait PubSubExt: PubSub {
    async fn publish<T: Serialize + Sync + ?Sized>(&self, channel: &str, value: &T) -> Result<u64> {
        let text = encode(value)?;
        self.publish_string(channel, &text).await
    }
}

impl<P: PubSub + ?Sized> PubSubExt for P {}
