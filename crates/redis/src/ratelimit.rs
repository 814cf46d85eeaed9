//! Redis rate limiter.
//!
//! Sliding windows are sorted sets of request timestamps (microseconds).
//! Token buckets are hashes `{tokens, last_refill}`. Both live under
//! `{prefix}ratelimit:{key}` and every admission is one Lua script call.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use uuid::Uuid;

use gopro_core::{
    config::RateLimitConfig,
    ratelimit::{validate_bucket, validate_window, window_micros, BUCKET_IDLE_TTL_SECS},
    ttl::ttl_millis,
    CacheError, KeySpace, KeyTtl, RateLimitInfo, RateLimiter, Result, TokenBucketDecision,
};

use crate::client::RedisClient;

const PIPELINE_BATCH: usize = 500;

/// KEYS[1] = window key.
/// ARGV[1] = now (µs), ARGV[2] = exclusive eviction bound `(now-window`,
/// ARGV[3] = limit, ARGV[4] = n, ARGV[5] = member nonce, ARGV[6] = ttl (ms).
///
/// Returns `{allowed, remaining}`.
static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[3])
local n = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[2])
local count = redis.call('ZCARD', key)

if count + n > limit then
    redis.call('PEXPIRE', key, ARGV[6])
    return {0, math.max(0, limit - count)}
end

for i = 1, n do
    redis.call('ZADD', key, now + i - 1, ARGV[5] .. ':' .. i)
end
redis.call('PEXPIRE', key, ARGV[6])
return {1, limit - count - n}
"#,
    )
});

/// KEYS[1] = bucket key.
/// ARGV[1] = capacity, ARGV[2] = refill per second, ARGV[3] = requested,
/// ARGV[4] = now (ms), ARGV[5] = idle ttl (s).
///
/// Only whole tokens are added and `last_refill` moves to `now` on every call,
/// so a partial token is discarded. Returns `{allowed, tokens_left}`.
static TOKEN_BUCKET: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + math.floor(elapsed * rate / 1000))

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, ARGV[5])
return {allowed, tokens}
"#,
    )
});

#[derive(Clone)]
pub struct RedisRateLimiter {
    client: RedisClient,
    keys: KeySpace,
    config: RateLimitConfig,
}

impl RedisRateLimiter {
    pub fn new(client: RedisClient, config: RateLimitConfig) -> Self {
        let keys = client.key_space(&config.prefix);
        Self {
            client,
            keys,
            config,
        }
    }

    /// Number of rate-limit keys currently present.
    pub async fn active_count(&self) -> Result<u64> {
        Ok(self.client.scan_all(&self.keys.all()).await?.len() as u64)
    }
}

fn reply_pair(reply: Vec<i64>, key: &str) -> Result<(bool, u64)> {
    match reply.as_slice() {
        [allowed, left] => Ok((*allowed == 1, (*left).max(0) as u64)),
        other => Err(CacheError::InvariantViolation(format!(
            "rate limit script for {key} returned {other:?}"
        ))),
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow_with_info(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        n: u64,
    ) -> Result<RateLimitInfo> {
        validate_window(limit, n, window)?;

        let full = self.keys.key(key);
        let now = Utc::now();
        let now_micros = now.timestamp_micros();
        let nonce = Uuid::new_v4().simple().to_string();

        let mut invocation = SLIDING_WINDOW.key(&full);
        invocation
            .arg(now_micros)
            .arg(format!("({}", now_micros - window_micros(window)))
            .arg(limit)
            .arg(n)
            .arg(&nonce)
            .arg(ttl_millis(window));
        let reply: Vec<i64> = self
            .client
            .invoke_script("RATELIMIT", &full, &invocation)
            .await?;
        let (allowed, remaining) = reply_pair(reply, key)?;

        tracing::trace!(key, limit, n, allowed, remaining, "sliding window decision");
        Ok(RateLimitInfo::new(limit, remaining, allowed, now, window))
    }

    async fn info(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitInfo> {
        validate_window(limit, 1, window)?;

        let full = self.keys.key(key);
        let now = Utc::now();
        let min = now.timestamp_micros() - window_micros(window);
        let count: u64 = self
            .client
            .query(
                "ZCOUNT",
                &full,
                redis::cmd("ZCOUNT").arg(&full).arg(min).arg("+inf"),
            )
            .await?;

        Ok(RateLimitInfo::new(
            limit,
            limit.saturating_sub(count),
            count < limit,
            now,
            window,
        ))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.client.del(&[self.keys.key(key)]).await?;
        Ok(())
    }

    async fn token_bucket_allow(
        &self,
        key: &str,
        capacity: u64,
        refill_per_sec: f64,
        requested: u64,
    ) -> Result<TokenBucketDecision> {
        validate_bucket(capacity, refill_per_sec, requested)?;

        let full = self.keys.key(key);
        let mut invocation = TOKEN_BUCKET.key(&full);
        invocation
            .arg(capacity)
            .arg(refill_per_sec.to_string())
            .arg(requested)
            .arg(Utc::now().timestamp_millis())
            .arg(BUCKET_IDLE_TTL_SECS);
        let reply: Vec<i64> = self
            .client
            .invoke_script("TOKEN BUCKET", &full, &invocation)
            .await?;
        let (allowed, tokens_left) = reply_pair(reply, key)?;

        Ok(TokenBucketDecision {
            allowed,
            tokens_left,
        })
    }

    async fn cleanup_expired_rate_limits(&self) -> Result<u64> {
        let keys = self.client.scan_all(&self.keys.all()).await?;
        let mut touched = 0;

        for batch in keys.chunks(PIPELINE_BATCH) {
            let mut pipe = redis::pipe();
            for key in batch {
                pipe.cmd("PTTL").arg(key);
            }
            let ttls: Vec<i64> = self
                .client
                .pipeline("PTTL", self.keys.base(), &pipe)
                .await?;

            for (key, reply) in batch.iter().zip(ttls) {
                if KeyTtl::from_millis(reply) != KeyTtl::Persistent {
                    continue;
                }
                let kind = self.client.key_type(key).await?;
                if kind != "zset" && kind != "hash" {
                    tracing::warn!(
                        key = %key,
                        kind = %kind,
                        "invariant violation: unexpected rate limit key type"
                    );
                }
                if self.client.expire(key, self.config.default_ttl).await? {
                    touched += 1;
                }
            }
        }

        if touched > 0 {
            tracing::debug!(touched, "assigned TTL to rate limit keys");
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::get_test_setup;

    async fn get_test_limiter() -> Option<RedisRateLimiter> {
        let (client, config) = get_test_setup().await?;
        Some(RedisRateLimiter::new(client, config.rate_limit))
    }

    #[tokio::test]
    async fn test_sliding_window_admission() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };
        let window = Duration::from_secs(2);

        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(limiter.allow("u1", 3, window).await.unwrap());
        }
        assert_eq!(results, vec![true, true, true, false, false]);

        // Every admission is now well outside the window.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(limiter.allow("u1", 3, window).await.unwrap());
        assert_eq!(limiter.remaining("u1", 3, window).await.unwrap(), 2);

        limiter.reset("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .allow("burst", 5, Duration::from_secs(30))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        limiter.reset("burst").await.unwrap();
    }

    #[tokio::test]
    async fn test_allow_n_and_info() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };
        let window = Duration::from_secs(30);

        let info = limiter.allow_with_info("batch", 10, window, 4).await.unwrap();
        assert!(info.allowed);
        assert_eq!(info.remaining, 6);
        assert_eq!(info.retry_after, None);

        assert!(!limiter.allow_n("batch", 10, window, 7).await.unwrap());
        assert_eq!(limiter.remaining("batch", 10, window).await.unwrap(), 6);

        let denied = limiter.allow_with_info("batch", 10, window, 7).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 6);
        assert!(denied.retry_after.is_some());

        assert!(limiter.allow_n("batch", 10, window, 6).await.unwrap());
        let info = limiter.info("batch", 10, window).await.unwrap();
        assert_eq!(info.remaining, 0);
        assert!(!info.allowed);

        limiter.reset("batch").await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_restores_full_budget() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };
        let window = Duration::from_secs(30);

        for _ in 0..3 {
            limiter.allow("r", 3, window).await.unwrap();
        }
        assert_eq!(limiter.remaining("r", 3, window).await.unwrap(), 0);

        limiter.reset("r").await.unwrap();
        assert_eq!(limiter.remaining("r", 3, window).await.unwrap(), 3);
        assert_eq!(limiter.remaining("never-seen", 3, window).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(limiter.token_bucket_allow("api", 2, 1.0, 1).await.unwrap().allowed);
        }
        assert_eq!(results, vec![true, true, false]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let decision = limiter.token_bucket_allow("api", 2, 1.0, 1).await.unwrap();
        assert_eq!(
            decision,
            TokenBucketDecision {
                allowed: true,
                tokens_left: 0
            }
        );

        assert!(matches!(
            limiter.client.ttl(&limiter.keys.key("api")).await.unwrap(),
            KeyTtl::Expires(_)
        ));
        limiter.reset("api").await.unwrap();
    }

    #[tokio::test]
    async fn test_token_bucket_discards_partial_refill() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        assert!(limiter.token_bucket_allow("steady", 1, 1.0, 1).await.unwrap().allowed);

        // Each call lands before a whole token accrues and restarts the refill clock.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let decision = limiter.token_bucket_allow("steady", 1, 1.0, 1).await.unwrap();
            assert_eq!(
                decision,
                TokenBucketDecision {
                    allowed: false,
                    tokens_left: 0
                }
            );
        }

        limiter.reset("steady").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        assert!(matches!(
            limiter.allow("x", 0, Duration::from_secs(1)).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.allow_n("x", 3, Duration::from_secs(1), 0).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.allow("x", 3, Duration::ZERO).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.token_bucket_allow("x", 0, 1.0, 1).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(limiter.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_assigns_missing_ttl() {
        let Some(limiter) = get_test_limiter().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        limiter
            .allow("live", 3, Duration::from_secs(30))
            .await
            .unwrap();
        limiter
            .client
            .query::<u64>(
                "ZADD",
                "",
                redis::cmd("ZADD")
                    .arg(limiter.keys.key("orphan"))
                    .arg(1)
                    .arg("m"),
            )
            .await
            .unwrap();

        assert_eq!(limiter.active_count().await.unwrap(), 2);
        assert_eq!(limiter.cleanup_expired_rate_limits().await.unwrap(), 1);
        assert!(matches!(
            limiter.client.ttl(&limiter.keys.key("orphan")).await.unwrap(),
            KeyTtl::Expires(_)
        ));
        assert_eq!(limiter.cleanup_expired_rate_limits().await.unwrap(), 0);

        limiter.reset("live").await.unwrap();
        limiter.reset("orphan").await.unwrap();
    }
}
