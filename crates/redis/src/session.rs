//! Redis session store.
//!
//! Each session has a primary key `{prefix}session:{id}` holding the JSON
//! record and, when the session has a user, a membership in the set
//! `{prefix}session:user:{user_id}`. The primary key is the source of truth;
//! the user sets are best-effort indexes repaired on read.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use gopro_core::{
    config::SessionConfig,
    serialization::{decode, encode},
    ttl::ttl_millis,
    CacheError, KeySpace, KeyTtl, Result, SessionData, SessionRecord, SessionStore,
};

use crate::client::RedisClient;

/// Keys closer than this to expiry are removed by cleanup.
const CLEANUP_THRESHOLD: Duration = Duration::from_secs(1);
const PIPELINE_BATCH: usize = 500;

#[derive(Clone)]
pub struct RedisSessionStore {
    client: RedisClient,
    keys: KeySpace,
    config: SessionConfig,
}

impl RedisSessionStore {
    pub fn new(client: RedisClient, config: SessionConfig) -> Self {
        let keys = client.key_space(&config.prefix);
        Self {
            client,
            keys,
            config,
        }
    }

    fn not_found(id: &str) -> CacheError {
        CacheError::SessionNotFound { id: id.to_string() }
    }

    async fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        match self.client.get(&self.keys.key(id)).await? {
            Some(text) => Ok(Some(decode(&text)?)),
            None => Ok(None),
        }
    }

    /// Writes the record and its index entry in one transaction.
    ///
    /// `previous_user` is dropped from its index when it differs from the record's user.
    async fn write(
        &self,
        record: &SessionRecord,
        ttl: Duration,
        previous_user: Option<&str>,
    ) -> Result<()> {
        let primary = self.keys.key(&record.id);
        let text = encode(record)?;
        let ttl_ms = ttl_millis(ttl);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET")
            .arg(&primary)
            .arg(text)
            .arg("PX")
            .arg(ttl_ms)
            .ignore();
        if let Some(user_id) = record.user_id.as_deref() {
            let index = self.keys.user_index_key(user_id);
            pipe.cmd("SADD").arg(&index).arg(&record.id).ignore();
            pipe.cmd("PEXPIRE").arg(&index).arg(ttl_ms).ignore();
        }
        if let Some(previous) = previous_user {
            if record.user_id.as_deref() != Some(previous) {
                pipe.cmd("SREM")
                    .arg(self.keys.user_index_key(previous))
                    .arg(&record.id)
                    .ignore();
            }
        }
        self.client.pipeline("SESSION WRITE", &primary, &pipe).await
    }

    async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<()> {
        let primary = self.keys.key(id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(&primary).ignore();
        if let Some(user_id) = user_id {
            pipe.cmd("SREM")
                .arg(self.keys.user_index_key(user_id))
                .arg(id)
                .ignore();
        }
        self.client.pipeline("SESSION DELETE", &primary, &pipe).await
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_session(&self, id: &str, data: SessionData, ttl: Duration) -> Result<()> {
        let ttl = if ttl.is_zero() {
            self.config.default_expiration
        } else {
            ttl
        };
        let record = SessionRecord::from_data(id, data, Utc::now(), ttl)?;
        self.write(&record, ttl, None).await?;
        tracing::debug!(session = id, user = ?record.user_id, "session created");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<SessionData> {
        let record = self.load(id).await?.ok_or_else(|| Self::not_found(id))?;
        if record.is_expired(Utc::now()) {
            self.remove(id, record.user_id.as_deref()).await?;
            return Err(Self::not_found(id));
        }
        Ok(record.to_flat_map())
    }

    async fn update_session(&self, id: &str, patch: SessionData) -> Result<()> {
        let mut record = self.load(id).await?.ok_or_else(|| Self::not_found(id))?;
        let now = Utc::now();
        let ttl = match self.client.ttl(&self.keys.key(id)).await? {
            KeyTtl::Missing => return Err(Self::not_found(id)),
            KeyTtl::Expires(remaining) => remaining,
            KeyTtl::Persistent => record.remaining(now),
        };
        if ttl.is_zero() {
            return Err(Self::not_found(id));
        }

        let previous_user = record.user_id.clone();
        record.apply_patch(patch, now);
        self.write(&record, ttl, previous_user.as_deref()).await
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        // An undecodable record still gets its primary key removed.
        let user_id = match self.load(id).await {
            Ok(record) => record.and_then(|r| r.user_id),
            Err(CacheError::Deserialization(reason)) => {
                tracing::warn!(session = id, %reason, "deleting undecodable session");
                None
            }
            Err(err) => return Err(err),
        };
        self.remove(id, user_id.as_deref()).await
    }

    async fn refresh_session(&self, id: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidArgument(
                "session refresh ttl must be > 0".to_string(),
            ));
        }
        let mut record = self.load(id).await?.ok_or_else(|| Self::not_found(id))?;
        record.refresh(Utc::now(), ttl)?;
        let user_id = record.user_id.clone();
        self.write(&record, ttl, user_id.as_deref()).await
    }

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<String>> {
        let index = self.keys.user_index_key(user_id);
        let mut members = self.client.smembers(&index).await?;
        if members.is_empty() {
            return Ok(members);
        }
        members.sort();

        let mut pipe = redis::pipe();
        for id in &members {
            pipe.cmd("EXISTS").arg(self.keys.key(id));
        }
        let exists: Vec<u64> = self.client.pipeline("EXISTS", &index, &pipe).await?;

        let (live, stale): (Vec<_>, Vec<_>) = members
            .into_iter()
            .zip(exists)
            .partition(|(_, exists)| *exists > 0);
        let live: Vec<String> = live.into_iter().map(|(id, _)| id).collect();
        let stale: Vec<String> = stale.into_iter().map(|(id, _)| id).collect();

        if !stale.is_empty() {
            tracing::debug!(user = user_id, stale = stale.len(), "pruning stale session index");
            self.client.srem(&index, &stale).await?;
        }
        Ok(live)
    }

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64> {
        let ids = self.list_user_sessions(user_id).await?;
        let index = self.keys.user_index_key(user_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.cmd("DEL").arg(self.keys.key(id)).ignore();
        }
        pipe.cmd("DEL").arg(&index).ignore();
        self.client
            .pipeline::<()>("SESSION DELETE USER", &index, &pipe)
            .await?;
        Ok(ids.len() as u64)
    }

    async fn session_count(&self) -> Result<u64> {
        let keys = self.client.scan_all(&self.keys.all()).await?;
        Ok(keys
            .iter()
            .filter(|k| !self.keys.is_user_index_key(k))
            .count() as u64)
    }

    async fn cleanup_expired_sessions(&self) -> Result<u64> {
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

            let expiring: Vec<&String> = batch
                .iter()
                .zip(ttls)
                .filter_map(|(key, reply)| match KeyTtl::from_millis(reply) {
                    KeyTtl::Missing => None,
                    KeyTtl::Persistent => {
                        tracing::warn!(key = %key, "session key without expiry");
                        Some(key)
                    }
                    KeyTtl::Expires(left) => (left < CLEANUP_THRESHOLD).then_some(key),
                })
                .collect();
            deleted += self.client.del(&expiring).await?;
        }

        if deleted > 0 {
            tracing::debug!(deleted, "cleaned up expired sessions");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::test_support::get_test_setup;

    async fn get_test_store() -> Option<RedisSessionStore> {
        let (client, config) = get_test_setup().await?;
        Some(RedisSessionStore::new(client, config.session))
    }

    fn data(value: Value) -> SessionData {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session(
                "s1",
                data(json!({"user_id": "u7", "email": "a@b"})),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(store.list_user_sessions("u7").await.unwrap(), vec!["s1"]);

        let session = store.get_session("s1").await.unwrap();
        assert_eq!(session["user_id"], json!("u7"));
        assert_eq!(session["email"], json!("a@b"));
        let expires_at: chrono::DateTime<Utc> = session["expires_at"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        let created_at: chrono::DateTime<Utc> = session["created_at"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(expires_at >= created_at);
        let left = expires_at - Utc::now();
        assert!(left > chrono::Duration::seconds(55) && left <= chrono::Duration::seconds(60));

        store.delete_session("s1").await.unwrap();
        let err = store.get_session("s1").await.unwrap_err();
        assert_eq!(
            err,
            CacheError::SessionNotFound {
                id: "s1".to_string()
            }
        );
        assert!(store.list_user_sessions("u7").await.unwrap().is_empty());

        store.delete_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_session_roundtrip_keeps_custom_entries() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let input = data(json!({
            "user_id": "u1",
            "roles": ["admin"],
            "cart": {"items": [1, 2, 3]},
            "visits": 4
        }));
        store
            .create_session("s2", input.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        let session = store.get_session("s2").await.unwrap();
        for (key, value) in &input {
            assert_eq!(session.get(key), Some(value), "missing {key}");
        }

        store.delete_user_sessions("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_session_default_ttl() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session("anon", SessionData::new(), Duration::ZERO)
            .await
            .unwrap();
        let ttl = store.client.ttl(&store.keys.key("anon")).await.unwrap();
        assert!(matches!(ttl, KeyTtl::Expires(d) if d > Duration::from_secs(23 * 3600)));

        store.delete_session("anon").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_session_merges_and_keeps_ttl() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session(
                "s3",
                data(json!({"user_id": "u3", "theme": "dark"})),
                Duration::from_secs(120),
            )
            .await
            .unwrap();
        store
            .update_session("s3", data(json!({"theme": "light", "lang": "es"})))
            .await
            .unwrap();

        let session = store.get_session("s3").await.unwrap();
        assert_eq!(session["theme"], json!("light"));
        assert_eq!(session["lang"], json!("es"));
        assert_eq!(session["user_id"], json!("u3"));
        assert_ne!(session["updated_at"], session["created_at"]);

        let ttl = store.client.ttl(&store.keys.key("s3")).await.unwrap();
        assert!(matches!(ttl, KeyTtl::Expires(d) if d <= Duration::from_secs(120) && d > Duration::from_secs(100)));

        store.delete_session("s3").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_session_moves_user_index() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session("s4", data(json!({"user_id": "old"})), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .update_session("s4", data(json!({"user_id": "new"})))
            .await
            .unwrap();

        assert!(store.list_user_sessions("old").await.unwrap().is_empty());
        assert_eq!(store.list_user_sessions("new").await.unwrap(), vec!["s4"]);

        store.delete_session("s4").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_session() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        let err = store
            .update_session("nope", SessionData::new())
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn test_refresh_session() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session("s5", data(json!({"user_id": "u5"})), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .refresh_session("s5", Duration::from_secs(600))
            .await
            .unwrap();

        let ttl = store.client.ttl(&store.keys.key("s5")).await.unwrap();
        assert!(matches!(ttl, KeyTtl::Expires(d) if d > Duration::from_secs(500)));

        assert!(matches!(
            store.refresh_session("s5", Duration::ZERO).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(store
            .refresh_session("missing", Duration::from_secs(5))
            .await
            .unwrap_err()
            .is_precondition_failed());

        store.delete_user_sessions("u5").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_user_sessions_prunes_stale_entries() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        for id in ["a", "b"] {
            store
                .create_session(id, data(json!({"user_id": "u9"})), Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.client.del(&[store.keys.key("a")]).await.unwrap();

        let live = store.list_user_sessions("u9").await.unwrap();
        assert_eq!(live, vec!["b"]);
        for id in &live {
            assert!(store.client.exists(&store.keys.key(id)).await.unwrap());
        }
        let index = store
            .client
            .smembers(&store.keys.user_index_key("u9"))
            .await
            .unwrap();
        assert_eq!(index, vec!["b"]);

        assert_eq!(store.delete_user_sessions("u9").await.unwrap(), 1);
        assert!(!store.client.exists(&store.keys.key("b")).await.unwrap());
        assert!(!store
            .client
            .exists(&store.keys.user_index_key("u9"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_session_count_excludes_user_index() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session("c1", data(json!({"user_id": "u1"})), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .create_session("c2", SessionData::new(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.session_count().await.unwrap(), 2);

        store.delete_session("c1").await.unwrap();
        store.delete_session("c2").await.unwrap();
        assert_eq!(store.session_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expiring_and_persistent_keys() {
        let Some(store) = get_test_store().await else {
            eprintln!("Skipping test: Redis not available");
            return;
        };

        store
            .create_session("long", SessionData::new(), Duration::from_secs(600))
            .await
            .unwrap();
        store
            .client
            .set(&store.keys.key("dying"), "{}", Some(Duration::from_millis(900)))
            .await
            .unwrap();
        store
            .client
            .set(&store.keys.key("leak"), "{}", None)
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired_sessions().await.unwrap(), 2);
        assert!(store.client.exists(&store.keys.key("long")).await.unwrap());
        assert!(!store.client.exists(&store.keys.key("leak")).await.unwrap());

        store.delete_session("long").await.unwrap();
    }
}
