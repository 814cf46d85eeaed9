//! Lock tokens and lock metadata.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

const TOKEN_BYTES: usize = 16;

/// Opaque fencing token written at lock acquisition.
///
/// Rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// Generates a fresh token from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub key: String,
    pub token: LockToken,
    pub ttl: Duration,
    /// Approximated as `now - ttl`; wrong once the lock has been extended.
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(key: impl Into<String>, token: LockToken, ttl: Duration, now: DateTime<Utc>) -> Self {
        let elapsed = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        Self {
            key: key.into(),
            token,
            ttl,
            created_at: now - elapsed,
        }
    }
}

/// Interprets the reply of the unlock and extend scripts.
///
/// `1` means done, `0` that the lock does not exist, `-1` that another token holds it.
pub fn script_outcome(reply: i64, key: &str) -> Result<()> {
    match reply {
        1 => Ok(()),
        0 => Err(CacheError::LockNotHeld {
            key: key.to_string(),
        }),
        -1 => Err(CacheError::TokenMismatch {
            key: key.to_string(),
        }),
        other => Err(CacheError::InvariantViolation(format!(
            "unexpected lock script reply {other} for {key}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_token_shape() {
        let token = LockToken::generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: std::collections::HashSet<_> =
            (0..1000).map(|_| LockToken::generate()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn test_lock_info_created_at() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 30).unwrap();
        let info = LockInfo::new(
            "job",
            LockToken::from("abc".to_string()),
            Duration::from_secs(30),
            now,
        );
        assert_eq!(
            info.created_at,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_script_outcome() {
        assert!(script_outcome(1, "k").is_ok());
        assert_eq!(
            script_outcome(0, "k"),
            Err(CacheError::LockNotHeld {
                key: "k".to_string()
            })
        );
        assert_eq!(
            script_outcome(-1, "k"),
            Err(CacheError::TokenMismatch {
                key: "k".to_string()
            })
        );
        assert!(matches!(
            script_outcome(7, "k"),
            Err(CacheError::InvariantViolation(_))
        ));
    }
}
