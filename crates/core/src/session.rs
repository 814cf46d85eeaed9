//! Session record model.
//!
//! Callers see a session as a flat JSON object. Internally a handful of
//! well-known entries are promoted to typed fields and everything else lives
//! in `custom`, so a record can be flattened back without losing entries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CacheError, Result};

/// Flat session data as exchanged with callers.
pub type SessionData = serde_json::Map<String, Value>;

/// Keys managed by the store itself; caller data cannot overwrite them.
pub const TIMING_KEYS: [&str; 3] = ["created_at", "updated_at", "expires_at"];

const STRING_FIELDS: [&str; 5] = ["user_id", "username", "email", "ip_address", "user_agent"];
const ROLES: &str = "roles";

/// A stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub custom: SessionData,
}

impl SessionRecord {
    /// Builds a new record from caller data, expiring `ttl` after `now`.
    pub fn from_data(
        id: impl Into<String>,
        data: SessionData,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self> {
        let mut record = Self {
            id: id.into(),
            user_id: None,
            username: None,
            email: None,
            roles: None,
            ip_address: None,
            user_agent: None,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono_ttl(ttl)?,
            custom: SessionData::new(),
        };
        for (key, value) in data {
            record.put(key, value);
        }
        Ok(record)
    }

    /// Overlays `patch` onto the record and stamps `updated_at`.
    ///
    /// Timing keys in the patch are ignored.
    pub fn apply_patch(&mut self, patch: SessionData, now: DateTime<Utc>) {
        for (key, value) in patch {
            self.put(key, value);
        }
        self.updated_at = now;
    }

    /// Moves the expiry to `now + ttl`.
    pub fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.expires_at = now + chrono_ttl(ttl)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Time left before `expires_at`, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Flattens the record into the caller-facing mapping.
    pub fn to_flat_map(&self) -> SessionData {
        let mut map = self.custom.clone();

        let strings = [
            ("user_id", &self.user_id),
            ("username", &self.username),
            ("email", &self.email),
            ("ip_address", &self.ip_address),
            ("user_agent", &self.user_agent),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        if let Some(roles) = &self.roles {
            map.insert(
                ROLES.to_string(),
                Value::Array(roles.iter().cloned().map(Value::String).collect()),
            );
        }

        map.insert("created_at".to_string(), timestamp(self.created_at));
        map.insert("updated_at".to_string(), timestamp(self.updated_at));
        map.insert("expires_at".to_string(), timestamp(self.expires_at));
        map
    }

    fn put(&mut self, key: String, value: Value) {
        if TIMING_KEYS.contains(&key.as_str()) {
            return;
        }
        // The new value decides where the entry lives.
        self.custom.remove(&key);

        if key == ROLES {
            self.roles = match &value {
                Value::Array(items) => string_array(items),
                _ => None,
            };
            if self.roles.is_none() {
                self.custom.insert(key, value);
            }
            return;
        }

        if STRING_FIELDS.contains(&key.as_str()) {
            let promoted = match value {
                Value::String(s) => Some(s),
                other => {
                    self.custom.insert(key.clone(), other);
                    None
                }
            };
            if let Some(slot) = self.string_slot(&key) {
                *slot = promoted;
            }
            return;
        }

        self.custom.insert(key, value);
    }

    fn string_slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            "user_id" => Some(&mut self.user_id),
            "username" => Some(&mut self.username),
            "email" => Some(&mut self.email),
            "ip_address" => Some(&mut self.ip_address),
            "user_agent" => Some(&mut self.user_agent),
            _ => None,
        }
    }
}

fn string_array(items: &[Value]) -> Option<Vec<String>> {
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

fn chrono_ttl(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|_| CacheError::InvalidArgument(format!("session ttl out of range: {ttl:?}")))
}
