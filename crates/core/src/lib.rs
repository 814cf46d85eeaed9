//! Pure building blocks for the gopro coordination layer.
//!
//! Nothing in this crate performs I/O. It holds configuration, the error
//! taxonomy, key namespacing, value encoding, the session, lock, rate-limit
//! and pub/sub models, and the capability traits implemented by
//! `gopro_redis`.

pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod pubsub;
pub mod ratelimit;
pub mod serialization;
pub mod session;
pub mod traits;
pub mod ttl;

pub use config::{
    Config, ConfigError, LockConfig, PubSubConfig, RateLimitConfig, RedisConfig, SessionConfig,
};
pub use error::{CacheError, ErrorKind, Result};
pub use keys::KeySpace;
pub use lock::{LockInfo, LockToken};
pub use pubsub::{Message, Subscription};
pub use ratelimit::{RateLimitInfo, TokenBucketDecision};
pub use session::{SessionData, SessionRecord};
pub use traits::{Cache, CacheExt, DistributedLock, PubSub, PubSubExt, RateLimiter, SessionStore};
pub use ttl::KeyTtl;
