//! Composition root for the Redis components.
//!
//! [`Manager`] owns one [`RedisClient`], builds the five components over it,
//! runs their periodic cleanup and shuts everything down in order.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use uuid::Uuid;

use gopro_core::{
    Cache, CacheError, Config, DistributedLock, PubSub, RateLimiter, Result, SessionData,
    SessionStore,
};

use crate::{
    cache::RedisCache, client::RedisClient, lock::RedisLock, pubsub::RedisPubSub,
    ratelimit::RedisRateLimiter, session::RedisSessionStore, with_deadline,
};

/// Upper bound of a single cleanup pass.
const CLEANUP_DEADLINE: Duration = Duration::from_secs(30);

/// How long `close` waits for each cleanup loop.
const LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// TTL of the scratch entries written by the health check.
const HEALTH_CHECK_TTL: Duration = Duration::from_secs(10);

/// Keys removed or repaired by one run of every cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions: u64,
    pub locks: u64,
    pub rate_limits: u64,
}

pub struct Manager {
    config: Config,
    client: RedisClient,
    cache: RedisCache,
    sessions: RedisSessionStore,
    locks: RedisLock,
    rate_limiter: RedisRateLimiter,
    pubsub: RedisPubSub,
    shutdown: broadcast::Sender<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Manager {
    /// Validates `config`, connects and starts the cleanup loops.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidArgument` for an invalid configuration and
    /// `CacheError::ConnectionFailed` if Redis cannot be reached.
    pub async fn connect(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CacheError::InvalidArgument(e.to_string()))?;
        let client = RedisClient::connect(&config.redis).await?;
        Ok(Self::with_client(client, config))
    }

    /// Builds the components over an existing client and starts the cleanup loops.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn with_client(client: RedisClient, config: Config) -> Self {
        let cache = RedisCache::new(client.clone());
        let sessions = RedisSessionStore::new(client.clone(), config.session.clone());
        let locks = RedisLock::new(client.clone(), config.lock.clone());
        let rate_limiter = RedisRateLimiter::new(client.clone(), config.rate_limit.clone());
        let pubsub = RedisPubSub::new(client.clone(), config.pubsub.clone());

        let (shutdown, _) = broadcast::channel(1);

        let loops = vec![
            spawn_cleanup(
                "sessions",
                config.session.cleanup_interval,
                shutdown.subscribe(),
                {
                    let sessions = sessions.clone();
                    move || {
                        let sessions = sessions.clone();
                        async move { sessions.cleanup_expired_sessions().await }
                    }
                },
            ),
            spawn_cleanup(
                "locks",
                config.lock.cleanup_interval,
                shutdown.subscribe(),
                {
                    let locks = locks.clone();
                    move || {
                        let locks = locks.clone();
                        async move { locks.cleanup_expired_locks().await }
                    }
                },
            ),
            spawn_cleanup(
                "rate_limits",
                config.rate_limit.cleanup_interval,
                shutdown.subscribe(),
                {
                    let rate_limiter = rate_limiter.clone();
                    move || {
                        let rate_limiter = rate_limiter.clone();
                        async move { rate_limiter.cleanup_expired_rate_limits().await }
                    }
                },
            ),
        ];

        tracing::info!(prefix = %config.redis.prefix, "Redis manager started");

        Self {
            config,
            client,
            cache,
            sessions,
            locks,
            rate_limiter,
            pubsub,
            shutdown,
            loops: Mutex::new(loops),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    pub fn cache(&self) -> &RedisCache {
        &self.cache
    }

    pub fn sessions(&self) -> &RedisSessionStore {
        &self.sessions
    }

    pub fn locks(&self) -> &RedisLock {
        &self.locks
    }

    pub fn rate_limiter(&self) -> &RedisRateLimiter {
        &self.rate_limiter
    }

    pub fn pubsub(&self) -> &RedisPubSub {
        &self.pubsub
    }

    /// Runs every cleanup pass once, in the foreground.
    pub async fn cleanup_once(&self) -> Result<CleanupReport> {
        Ok(CleanupReport {
            sessions: self.sessions.cleanup_expired_sessions().await?,
            locks: self.locks.cleanup_expired_locks().await?,
            rate_limits: self.rate_limiter.cleanup_expired_rate_limits().await?,
        })
    }

    /// Round-trips a scratch entry through every component.
    ///
    /// # Errors
    ///
    /// `CacheError::HealthCheck` names the first component that failed;
    /// `CacheError::Timeout` if `deadline` elapses first.
    pub async fn health_check(&self, deadline: Duration) -> Result<()> {
        with_deadline(deadline, "health check", self.check_components()).await
    }

    async fn check_components(&self) -> Result<()> {
        let scratch = format!("health:{}", Uuid::new_v4().simple());

        self.client.ping().await.map_err(unhealthy("redis"))?;
        self.check_cache(&scratch).await.map_err(unhealthy("cache"))?;
        self.check_sessions(&scratch)
            .await
            .map_err(unhealthy("sessions"))?;
        self.check_locks(&scratch).await.map_err(unhealthy("locks"))?;
        self.check_rate_limits(&scratch)
            .await
            .map_err(unhealthy("rate_limits"))?;
        Ok(())
    }

    async fn check_cache(&self, scratch: &str) -> Result<()> {
        self.cache.set_raw(scratch, "ok", Some(HEALTH_CHECK_TTL)).await?;
        let value = self.cache.get_raw(scratch).await?;
        self.cache.delete(scratch).await?;
        if value != "ok" {
            return Err(CacheError::InvariantViolation(format!(
                "read back {value:?}"
            )));
        }
        Ok(())
    }

    async fn check_sessions(&self, scratch: &str) -> Result<()> {
        let mut data = SessionData::new();
        data.insert("health".to_string(), Value::Bool(true));
        self.sessions.create_session(scratch, data, HEALTH_CHECK_TTL).await?;
        self.sessions.delete_session(scratch).await
    }

    async fn check_locks(&self, scratch: &str) -> Result<()> {
        let token = self
            .locks
            .acquire(scratch, HEALTH_CHECK_TTL)
            .await?
            .ok_or_else(|| CacheError::InvariantViolation("scratch lock held".to_string()))?;
        self.locks.unlock_with_value(scratch, &token).await
    }

    async fn check_rate_limits(&self, scratch: &str) -> Result<()> {
        let allowed = self.rate_limiter.allow(scratch, 1, HEALTH_CHECK_TTL).await?;
        self.rate_limiter.reset(scratch).await?;
        if !allowed {
            return Err(CacheError::InvariantViolation(
                "scratch key was rate limited".to_string(),
            ));
        }
        Ok(())
    }

    /// Pool counters, server info and per-component key counts.
    pub async fn stats(&self, deadline: Duration) -> Result<Map<String, Value>> {
        with_deadline(deadline, "stats", async {
            let pool = self.client.stats();
            let info = self.client.info(&["memory", "stats", "keyspace"]).await?;

            let mut stats = Map::new();
            stats.insert("pool_hits".into(), json!(pool.hits));
            stats.insert("pool_misses".into(), json!(pool.misses));
            stats.insert("pool_timeouts".into(), json!(pool.timeouts));
            stats.insert("pool_total_conns".into(), json!(pool.total_conns));
            stats.insert("pool_idle_conns".into(), json!(pool.idle_conns));
            stats.insert("pool_stale_conns".into(), json!(pool.stale_conns));
            stats.insert("redis_info".into(), json!(info));
            stats.insert(
                "session_count".into(),
                json!(self.sessions.session_count().await?),
            );
            stats.insert("active_locks".into(), json!(self.locks.active_count().await?));
            stats.insert(
                "active_rate_limits".into(),
                json!(self.rate_limiter.active_count().await?),
            );
            Ok(stats)
        })
        .await
    }

    /// Stops the cleanup loops, then closes pub/sub, then the cache and its client.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // No receivers left just means every loop already stopped.
        let _ = self.shutdown.send(());
        let loops = match self.loops.lock() {
            Ok(mut loops) => std::mem::take(&mut *loops),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in loops {
            let abort = handle.abort_handle();
            if tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, handle)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        self.pubsub.close().await?;
        self.cache.close().await?;

        tracing::info!("Redis manager closed");
        Ok(())
    }
}

fn unhealthy(component: &'static str) -> impl Fn(CacheError) -> CacheError {
    move |err| CacheError::HealthCheck {
        component,
        reason: err.to_string(),
    }
}

fn spawn_cleanup<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    match with_deadline(CLEANUP_DEADLINE, name, job()).await {
                        Ok(count) => tracing::debug!(task = name, count, "cleanup pass finished"),
                        Err(e) => tracing::error!(task = name, error = %e, "cleanup pass failed"),
                    }
                }
            }
        }
        tracing::debug!(task = name, "cleanup loop stopped");
    })
}
