//! Configuration types for the coordination layer.
//!
//! All values can be loaded from the environment with [`Config::from_env`].
//! Durations accept humantime strings (`"5s"`, `"250ms"`, `"1h30m"`) or a bare
//! integer number of seconds.

use std::{env, time::Duration};

use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Connection and pool settings for the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    /// Hard cap on concurrent connections.
    pub pool_size: usize,
    /// Connections dialed up-front when the pool is created.
    pub min_idle_conns: usize,
    /// Retries for transient failures (dropped or refused connection, I/O timeout).
    pub max_retries: u32,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Maximum wait for a free pooled connection.
    pub pool_timeout: Duration,
    /// Pooled connections unused for longer than this are evicted.
    pub idle_timeout: Duration,
    /// Process-wide namespace prefix applied to every key.
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            database: 0,
            pool_size: 10,
            min_idle_conns: 5,
            max_retries: 3,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            pool_timeout: Duration::from_secs(4),
            idle_timeout: Duration::from_secs(5 * 60),
            prefix: "gopro:".to_string(),
        }
    }
}

impl RedisConfig {
    /// Renders the connection URL (`redis://[:password@]host:port/db`).
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.database
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }

    /// Deadline for one command round trip.
    pub fn io_timeout(&self) -> Duration {
        self.write_timeout + self.read_timeout
    }
}

/// Session store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub prefix: String,
    pub default_expiration: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: "session:".to_string(),
            default_expiration: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub prefix: String,
    pub default_timeout: Duration,
    pub cleanup_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: "lock:".to_string(),
            default_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5 * 60),
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub prefix: String,
    pub cleanup_interval: Duration,
    /// TTL assigned by cleanup to rate-limit keys that have none.
    pub default_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            prefix: "ratelimit:".to_string(),
            cleanup_interval: Duration::from_secs(10 * 60),
            default_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Pub/sub settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    pub prefix: String,
    /// Capacity of each subscription's outbound queue.
    pub buffer_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            prefix: "pubsub:".to_string(),
            buffer_size: crate::pubsub::SUBSCRIPTION_BUFFER,
        }
    }
}

/// Complete configuration for the coordination layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub redis: RedisConfig,
    pub session: SessionConfig,
    pub lock: LockConfig,
    pub rate_limit: RateLimitConfig,
    pub pubsub: PubSubConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`, `REDIS_PREFIX`
    /// - `REDIS_POOL_SIZE`, `REDIS_MIN_IDLE_CONNS`, `REDIS_MAX_RETRIES`
    /// - `REDIS_DIAL_TIMEOUT`, `REDIS_READ_TIMEOUT`, `REDIS_WRITE_TIMEOUT`,
    ///   `REDIS_POOL_TIMEOUT`, `REDIS_IDLE_TIMEOUT`
    /// - `REDIS_SESSION_PREFIX`, `SESSION_DEFAULT_EXPIRATION`, `SESSION_CLEANUP_INTERVAL`
    /// - `REDIS_LOCK_PREFIX`, `LOCK_DEFAULT_TIMEOUT`, `LOCK_CLEANUP_INTERVAL`
    /// - `REDIS_RATELIMIT_PREFIX`, `RATELIMIT_CLEANUP_INTERVAL`
    /// - `REDIS_PUBSUB_PREFIX`
    ///
    /// Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = Config::default();

        let redis = RedisConfig {
            host: vars.string("REDIS_HOST", defaults.redis.host),
            port: vars.parsed("REDIS_PORT", defaults.redis.port)?,
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
            database: vars.parsed("REDIS_DB", defaults.redis.database)?,
            pool_size: vars.parsed("REDIS_POOL_SIZE", defaults.redis.pool_size)?,
            min_idle_conns: vars.parsed("REDIS_MIN_IDLE_CONNS", defaults.redis.min_idle_conns)?,
            max_retries: vars.parsed("REDIS_MAX_RETRIES", defaults.redis.max_retries)?,
            dial_timeout: vars.duration("REDIS_DIAL_TIMEOUT", defaults.redis.dial_timeout)?,
            read_timeout: vars.duration("REDIS_READ_TIMEOUT", defaults.redis.read_timeout)?,
            write_timeout: vars.duration("REDIS_WRITE_TIMEOUT", defaults.redis.write_timeout)?,
            pool_timeout: vars.duration("REDIS_POOL_TIMEOUT", defaults.redis.pool_timeout)?,
            idle_timeout: vars.duration("REDIS_IDLE_TIMEOUT", defaults.redis.idle_timeout)?,
            prefix: vars.string("REDIS_PREFIX", defaults.redis.prefix),
        };

        let session = SessionConfig {
            prefix: vars.string("REDIS_SESSION_PREFIX", defaults.session.prefix),
            default_expiration: vars.duration(
                "SESSION_DEFAULT_EXPIRATION",
                defaults.session.default_expiration,
            )?,
            cleanup_interval: vars
                .duration("SESSION_CLEANUP_INTERVAL", defaults.session.cleanup_interval)?,
        };

        let lock = LockConfig {
            prefix: vars.string("REDIS_LOCK_PREFIX", defaults.lock.prefix),
            default_timeout: vars.duration("LOCK_DEFAULT_TIMEOUT", defaults.lock.default_timeout)?,
            cleanup_interval: vars
                .duration("LOCK_CLEANUP_INTERVAL", defaults.lock.cleanup_interval)?,
            retry_delay: defaults.lock.retry_delay,
        };

        let rate_limit = RateLimitConfig {
            prefix: vars.string("REDIS_RATELIMIT_PREFIX", defaults.rate_limit.prefix),
            cleanup_interval: vars.duration(
                "RATELIMIT_CLEANUP_INTERVAL",
                defaults.rate_limit.cleanup_interval,
            )?,
            default_ttl: defaults.rate_limit.default_ttl,
        };

        let pubsub = PubSubConfig {
            prefix: vars.string("REDIS_PUBSUB_PREFIX", defaults.pubsub.prefix),
            buffer_size: defaults.pubsub.buffer_size,
        };

        Ok(Self {
            redis,
            session,
            lock,
            rate_limit,
            pubsub,
        })
    }

    /// Check values that would make the layer unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be > 0".to_string()));
        }
        if self.redis.min_idle_conns > self.redis.pool_size {
            return Err(ConfigError::Invalid(format!(
                "min_idle_conns ({}) exceeds pool_size ({})",
                self.redis.min_idle_conns, self.redis.pool_size
            )));
        }
        if self.pubsub.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be > 0".to_string()));
        }
        let intervals = [
            ("session cleanup_interval", self.session.cleanup_interval),
            ("lock cleanup_interval", self.lock.cleanup_interval),
            ("rate limit cleanup_interval", self.rate_limit.cleanup_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str, default: String) -> String {
        (self.0)(var).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(var).filter(|v| !v.is_empty()) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    var,
                    reason: e.to_string(),
                    value,
                }),
        }
    }

    fn duration(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match (self.0)(var).filter(|v| !v.is_empty()) {
            None => Ok(default),
            Some(value) => parse_duration(&value).map_err(|reason| ConfigError::InvalidValue {
                var,
                value,
                reason,
            }),
        }
    }
}

/// Parses `"5s"`-style durations; a bare integer is a number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.redis.prefix, "gopro:");
        assert_eq!(config.session.prefix, "session:");
        assert_eq!(config.lock.prefix, "lock:");
        assert_eq!(config.rate_limit.prefix, "ratelimit:");
        assert_eq!(config.pubsub.prefix, "pubsub:");
        assert_eq!(config.pubsub.buffer_size, 100);
        assert_eq!(config.session.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.lock.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.rate_limit.cleanup_interval, Duration::from_secs(600));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_DB", "2"),
            ("REDIS_PREFIX", "app:"),
            ("REDIS_POOL_SIZE", "20"),
            ("REDIS_MIN_IDLE_CONNS", "2"),
            ("REDIS_MAX_RETRIES", "5"),
            ("REDIS_DIAL_TIMEOUT", "250ms"),
            ("REDIS_IDLE_TIMEOUT", "10m"),
            ("REDIS_SESSION_PREFIX", "sess:"),
            ("SESSION_DEFAULT_EXPIRATION", "1h30m"),
            ("REDIS_LOCK_PREFIX", "mutex:"),
            ("LOCK_DEFAULT_TIMEOUT", "45"),
            ("REDIS_RATELIMIT_PREFIX", "rl:"),
        ]))
        .unwrap();

        assert_eq!(config.redis.host, "cache.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.password.as_deref(), Some("s3cret"));
        assert_eq!(config.redis.database, 2);
        assert_eq!(config.redis.prefix, "app:");
        assert_eq!(config.redis.pool_size, 20);
        assert_eq!(config.redis.min_idle_conns, 2);
        assert_eq!(config.redis.max_retries, 5);
        assert_eq!(config.redis.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.redis.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.session.prefix, "sess:");
        assert_eq!(
            config.session.default_expiration,
            Duration::from_secs(90 * 60)
        );
        assert_eq!(config.lock.prefix, "mutex:");
        assert_eq!(config.lock.default_timeout, Duration::from_secs(45));
        assert_eq!(config.rate_limit.prefix, "rl:");
    }

    #[test]
    fn test_invalid_port() {
        let err = Config::from_lookup(lookup(&[("REDIS_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "REDIS_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_duration() {
        let err = Config::from_lookup(lookup(&[("REDIS_READ_TIMEOUT", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "REDIS_READ_TIMEOUT",
                ..
            }
        ));
    }

    #[test]
    fn test_url_without_password() {
        let config = RedisConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_url_encodes_password() {
        let config = RedisConfig {
            password: Some("p@ss:word".to_string()),
            database: 3,
            ..RedisConfig::default()
        };
        assert_eq!(config.url(), "redis://:p%40ss%3Aword@localhost:6379/3");
    }

    #[test]
    fn test_io_timeout() {
        let config = RedisConfig::default();
        assert_eq!(config.io_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.redis.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.redis.min_idle_conns = 50;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lock.cleanup_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert!(parse_duration("-1s").is_err());
    }
}
