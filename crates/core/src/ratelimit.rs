//! Rate-limit window math and decisions.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Inactivity TTL of a token bucket, in seconds.
pub const BUCKET_IDLE_TTL_SECS: u64 = 60 * 60;

/// Outcome of a sliding-window admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// End of the aligned window containing the request.
    pub reset_at: DateTime<Utc>,
    pub allowed: bool,
    /// Set when the request was denied.
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    pub fn new(limit: u64, remaining: u64, allowed: bool, now: DateTime<Utc>, window: Duration) -> Self {
        let reset_at = reset_at(now, window);
        let retry_after = if allowed {
            None
        } else {
            Some((reset_at - now).to_std().unwrap_or(Duration::ZERO))
        };
        Self {
            limit,
            remaining,
            reset_at,
            allowed,
            retry_after,
        }
    }
}

/// Outcome of a token-bucket admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBucketDecision {
    pub allowed: bool,
    pub tokens_left: u64,
}

/// Rejects arguments no window can satisfy.
pub fn validate_window(limit: u64, n: u64, window: Duration) -> Result<()> {
    if limit == 0 {
        return Err(CacheError::InvalidArgument("limit must be > 0".to_string()));
    }
    if n == 0 {
        return Err(CacheError::InvalidArgument("n must be > 0".to_string()));
    }
    if window_micros(window) == 0 {
        return Err(CacheError::InvalidArgument(
            "window must be at least 1µs".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_bucket(capacity: u64, refill_per_sec: f64, requested: u64) -> Result<()> {
    if capacity == 0 {
        return Err(CacheError::InvalidArgument("capacity must be > 0".to_string()));
    }
    if !refill_per_sec.is_finite() || refill_per_sec < 0.0 {
        return Err(CacheError::InvalidArgument(format!(
            "refill rate must be a non-negative number, got {refill_per_sec}"
        )));
    }
    if requested == 0 {
        return Err(CacheError::InvalidArgument(
            "requested tokens must be > 0".to_string(),
        ));
    }
    Ok(())
}

pub fn window_micros(window: Duration) -> i64 {
    i64::try_from(window.as_micros()).unwrap_or(i64::MAX)
}

/// `now` truncated to a multiple of `window` since the epoch.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let micros = now.timestamp_micros();
    let size = window_micros(window).max(1);
    let start = micros - micros.rem_euclid(size);
    Utc.timestamp_micros(start).single().unwrap_or(now)
}

pub fn reset_at(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let start = window_start(now, window);
    start + chrono::Duration::microseconds(window_micros(window))
}
