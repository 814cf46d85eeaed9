//! Redis and pool error mapping to CacheError.

use deadpool_redis::PoolError;
use gopro_core::CacheError;

/// Maps Redis errors to CacheError, tagging the message with the command and key.
pub fn map_redis_error(op: &str, key: &str, err: redis::RedisError) -> CacheError {
    let context = context(op, key);
    if err.is_timeout() {
        CacheError::timeout(context)
    } else if is_transient(&err) {
        CacheError::ConnectionFailed(format!("{context}: {err}"))
    } else {
        CacheError::OperationFailed(format!("{context}: {err}"))
    }
}

/// Maps pool checkout errors to CacheError.
pub fn map_pool_error(err: PoolError) -> CacheError {
    match err {
        PoolError::Timeout(kind) => {
            CacheError::PoolExhausted(format!("no connection available ({kind:?} timeout)"))
        }
        PoolError::Closed => CacheError::Closed,
        PoolError::Backend(e) => map_redis_error("CONNECT", "", e),
        other => CacheError::ConnectionFailed(other.to_string()),
    }
}

/// Failures worth retrying: dropped or refused connections and I/O errors.
pub fn is_transient(err: &redis::RedisError) -> bool {
    err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
}

fn context(op: &str, key: &str) -> String {
    if key.is_empty() {
        op.to_string()
    } else {
        format!("{op} {key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{ErrorKind, RedisError};

    #[test]
    fn test_server_error_is_operation_failed() {
        let err = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        let mapped = map_redis_error("GET", "gopro:user:1", err);
        assert!(matches!(mapped, CacheError::OperationFailed(_)));
        assert!(mapped.to_string().contains("GET gopro:user:1"));
    }

    #[test]
    fn test_io_error_is_connection_failed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let mapped = map_redis_error("SET", "k", RedisError::from(io));
        assert!(matches!(mapped, CacheError::ConnectionFailed(_)));
        assert!(mapped.is_transport());
    }

    #[test]
    fn test_io_timeout_is_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let mapped = map_redis_error("PING", "", RedisError::from(io));
        assert_eq!(mapped, CacheError::timeout("PING"));
    }

    #[test]
    fn test_pool_closed() {
        assert_eq!(map_pool_error(PoolError::Closed), CacheError::Closed);
    }
}
