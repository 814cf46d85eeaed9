//! Redis-backed coordination layer.
//!
//! One pooled [`RedisClient`] feeds five components: a keyed cache, a
//! session store, a distributed lock, a rate limiter and a pub/sub bus.
//! [`Manager`] builds them over a shared client, runs their cleanup loops
//! and shuts everything down in order.

use std::{future::Future, time::Duration};

use gopro_core::{CacheError, Result};

pub mod cache;
pub mod client;
pub mod error;
pub mod lock;
pub mod manager;
pub mod pubsub;
pub mod ratelimit;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::RedisCache;
pub use client::{PoolStats, RedisClient};
pub use lock::{LockGuard, RedisLock};
pub use manager::Manager;
pub use pubsub::RedisPubSub;
pub use ratelimit::RedisRateLimiter;
pub use session::RedisSessionStore;

/// Runs `future` under a deadline, mapping expiry to `CacheError::Timeout`.
///
/// The future is dropped on expiry, which cancels it.
pub async fn with_deadline<T, F>(deadline: Duration, op: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::timeout(op)),
    }
}
