use std::time::Duration;

/// Expiration state of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists without an expiration.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Interprets a `PTTL` reply (`-2` missing, `-1` no expiry, otherwise milliseconds).
    pub fn from_millis(reply: i64) -> Self {
        match reply {
            -2 => Self::Missing,
            r if r < 0 => Self::Persistent,
            ms => Self::Expires(Duration::from_millis(ms as u64)),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Normalizes a caller TTL; `None` and zero both mean "no expiration".
pub fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|d| !d.is_zero())
}

/// Rounds a TTL up to whole milliseconds, never below one.
pub fn ttl_millis(ttl: Duration) -> u64 {
    let ms = ttl.as_millis();
    let ms = if Duration::from_millis(ms as u64) < ttl {
        ms + 1
    } else {
        ms
    };
    u64::try_from(ms).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_millis() {
        assert_eq!(KeyTtl::from_millis(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_millis(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_millis(1500),
            KeyTtl::Expires(Duration::from_millis(1500))
        );
        assert!(!KeyTtl::Missing.exists());
        assert!(KeyTtl::Persistent.exists());
        assert_eq!(KeyTtl::Persistent.remaining(), None);
    }

    #[test]
    fn test_effective_ttl() {
        assert_eq!(effective_ttl(None), None);
        assert_eq!(effective_ttl(Some(Duration::ZERO)), None);
        assert_eq!(
            effective_ttl(Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_ttl_millis_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5000);
        assert_eq!(ttl_millis(Duration::from_micros(1500)), 2);
        assert_eq!(ttl_millis(Duration::from_nanos(1)), 1);
    }
}
