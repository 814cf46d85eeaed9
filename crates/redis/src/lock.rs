//! Redis distributed lock.
//!
//! A lock is the key `{prefix}lock:{key}` holding a random token, written
//! with `SET NX PX`. Release and extension run as Lua scripts so the check
//! and the mutation are one atomic step on the server.

use std::{future::Future, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;

use gopro_core::{
    config::LockConfig,
    lock::script_outcome,
    ttl::ttl_millis,
    CacheError, DistributedLock, KeySpace, KeyTtl, LockInfo, LockToken, Result,
};

use crate::client::RedisClient;

const PIPELINE_BATCH: usize = 500;

/// Deletes the key if it exists, whoever holds it.
///
/// KEYS[1] = lock key. Returns 1 when deleted, 0 when missing.
static UNLOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#,
    )
});

/// Deletes the key only if it holds the caller's token.
///
/// KEYS[1] = lock key, ARGV[1] = token. Returns 1 deleted, 0 missing, -1 mismatch.
static UNLOCK_WITH_VALUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if current ~= ARGV[1] then
    return -1
end
redis.call('DEL', KEYS[1])
return 1
"#,
    )
});

/// KEYS[1] = lock key, ARGV[1] = ttl in ms. Returns 1 extended, 0 missing.
static EXTEND: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    return 1
end
return 0
"#,
    )
});

/// KEYS[1] = lock key, ARGV[1] = token, ARGV[2] = ttl in ms.
/// Returns 1 extended, 0 missing, -1 mismatch.
static EXTEND_WITH_VALUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if current ~= ARGV[1] then
    return -1
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#,
    )
});

#[derive(Clone)]
pub struct RedisLock {
    client: RedisClient,
    keys: KeySpace,
    config: LockConfig,
}

impl RedisLock {
    pub fn new(client: RedisClient, config: LockConfig) -> Self {
        let keys = client.key_space(&config.prefix);
        Self {
            client,
            keys,
            config,
        }
    }

    fn ttl_or_default(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.config.default_timeout
        } else {
            ttl
        }
    }

    /// Number of lock keys currently present.
    pub async fn active_count(&self) -> Result<u64> {
        Ok(self.client.scan_all(&self.keys.all()).await?.len() as u64)
    }

    /// Acquires `key` and returns a guard that releases it when dropped.
    pub async fn guard(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        Ok(self
            .acquire(key, ttl)
            .await?
            .map(|token| LockGuard::new(self.clone(), key, token)))
    }

    /// Runs `f` while holding `key`, failing with `AttemptsExhausted` if it is held.
    ///
    /// The lock is released with its token on every exit path. A release failure is
    /// logged and never replaces the result of `f`.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CacheError>,
    {
        let Some(guard) = self.guard(key, ttl).await? else {
            return Err(CacheError::AttemptsExhausted {
                key: key.to_string(),
                attempts: 1,
            }
            .into());
        };
        run_guarded(guard, f).await
    }

    /// Like [`RedisLock::with_lock`], retrying acquisition first.
    pub async fn with_lock_retry<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        delay: Duration,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CacheError>,
    {
        let token = self.lock_with_retry(key, ttl, max_retries, delay).await?;
        run_guarded(LockGuard::new(self.clone(), key, token), f).await
    }
}

async fn run_guarded<T, E, F, Fut>(guard: LockGuard, f: F) -> std::result::Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let result = f().await;
    let key = guard.key.clone();
    if let Err(err) = guard.release().await {
        tracing::warn!(key = %key, error = %err, "failed to release lock");
    }
    result
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let ttl = self.ttl_or_default(ttl);
        let token = LockToken::generate();
        let acquired = self
            .client
            .set_nx(&self.keys.key(key), token.as_str(), Some(ttl))
            .await?;
        tracing::debug!(key, acquired, "lock attempt");
        Ok(acquired.then_some(token))
    }

    async fn lock_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        delay: Duration,
    ) -> Result<LockToken> {
        let attempts = max_retries.max(1);
        let delay = if delay.is_zero() {
            self.config.retry_delay
        } else {
            delay
        };

        for attempt in 1..=attempts {
            if let Some(token) = self.acquire(key, ttl).await? {
                return Ok(token);
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(CacheError::AttemptsExhausted {
            key: key.to_string(),
            attempts,
        })
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        let full = self.keys.key(key);
        let invocation = UNLOCK.key(&full);
        let reply: i64 = self
            .client
            .invoke_script("UNLOCK", &full, &invocation)
            .await?;
        script_outcome(reply, key)
    }

    async fn unlock_with_value(&self, key: &str, token: &LockToken) -> Result<()> {
        let full = self.keys.key(key);
        let mut invocation = UNLOCK_WITH_VALUE.key(&full);
        invocation.arg(token.as_str());
        let reply: i64 = self
            .client
            .invoke_script("UNLOCK", &full, &invocation)
            .await?;
        script_outcome(reply, key)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<()> {
        let full = self.keys.key(key);
        let mut invocation = EXTEND.key(&full);
        invocation.arg(ttl_millis(self.ttl_or_default(ttl)));
        let reply: i64 = self
            .client
            .invoke_script("EXTEND", &full, &invocation)
            .await?;
        script_outcome(reply, key)
    }

    async fn extend_with_value(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<()> {
        let full = self.keys.key(key);
        let mut invocation = EXTEND_WITH_VALUE.key(&full);
        invocation
            .arg(token.as_str())
            .arg(ttl_millis(self.ttl_or_default(ttl)));
        let reply: i64 = self
            .client
            .invoke_script("EXTEND", &full, &invocation)
            .await?;
        script_outcome(reply, key)
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        self.client.exists(&self.keys.key(key)).await
    }

    async fn lock_ttl(&self, key: &str) -> Result<KeyTtl> {
        self.client.ttl(&self.keys.key(key)).await
    }

    async fn lock_info(&self, key: &str) -> Result<LockInfo> {
        let full = self.keys.key(key);
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(&full).cmd("PTTL").arg(&full);
        let (token, ttl): (Option<String>, i64) =
            self.client.pipeline("LOCK INFO", &full, &pipe).await?;

        let token = token.ok_or_else(|| CacheError::miss(full))?;
        let ttl = KeyTtl::from_millis(ttl).remaining().unwrap_or(Duration::ZERO);
        Ok(LockInfo::new(key, LockToken::from(token), ttl, Utc::now()))
    }

    async fn cleanup_expired_locks(&self) -> Result<u64> {
        let keys = self.client.scan_all(&self.keys.all()).await?;
        let mut deleted = 0;

        for batch in keys.chunks(PIPELINE_BATCH) {
            let mut pipe = redis::pipe();
            for key in batch {
                pipe.cmd("PTTL").arg(key);
            }
            let ttls: Vec<i64> = self
                .client
                .pipeline("PTTL", self.keys.base(), &pipe)
                .await?;

            let doomed: Vec<&String> = batch
                .iter()
                .zip(ttls)
                .filter_map(|(key, reply)| match KeyTtl::from_millis(reply) {
                    KeyTtl::Persistent => {
                        tracing::warn!(
                            key = %key,
                            "invariant violation: lock without expiry"
                        );
                        Some(key)
                    }
                    KeyTtl::Missing => Some(key),
                    KeyTtl::Expires(_) => None,
                })
                .collect();
            deleted += self.client.del(&doomed).await?;
        }

        if deleted > 0 {
            tracing::debug!(deleted, "cleaned up expired locks");
        }
        Ok(deleted)
    }
}

/// A held lock, released with its token when dropped.
///
/// Prefer [`LockGuard::release`], which reports the outcome. Dropping the
/// guard inside a Tokio runtime spawns the release instead.
pub struct LockGuard {
    lock: RedisLock,
    key: String,
    token: Option<LockToken>,
}

impl LockGuard {
    fn new(lock: RedisLock, key: &str, token: LockToken) -> Self {
        Self {
            lock,
            key: key.to_string(),
            token: Some(token),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Resets the expiry while still holding the lock.
    pub async fn extend(&self, ttl: Duration) -> Result<()> {
        match &self.token {
            Some(token) => self.lock.extend_with_value(&self.key, token, ttl).await,
            None => Err(CacheError::LockNotHeld {
                key: self.key.clone(),
            }),
        }
    }

    pub async fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.lock.unlock_with_value(&self.key, &token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lock = self.lock.clone();
                handle.spawn(async move {
                    if let Err(err) = lock.unlock_with_value(&key, &token).await {
                        tracing::warn!(key = %key, error = %err, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "no runtime to release dropped lock; it will expire");
            }
        }
    }
}
