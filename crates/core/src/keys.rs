//! Key namespacing.
//!
//! Every key the layer touches has the shape `{prefix}{component}{user_key}`,
//! where `prefix` is the process-wide namespace (`gopro:` by default) and
//! `component` is the sub-prefix of the owning component (`session:`,
//! `lock:`, `ratelimit:`, `pubsub:`, or empty for the plain cache).

/// Sub-prefix segment used for the per-user session index.
pub const USER_INDEX_SEGMENT: &str = "user:";

/// A component's slice of the key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    base: String,
}

impl KeySpace {
    /// Creates a key space for `component` under the process-wide `prefix`.
    pub fn new(prefix: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            base: format!("{}{}", prefix.into(), component.into()),
        }
    }

    /// Key space for the plain cache (no component sub-prefix).
    pub fn root(prefix: impl Into<String>) -> Self {
        Self::new(prefix, "")
    }

    /// Returns `{prefix}{component}`.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Returns the full key for a caller-supplied key.
    pub fn key(&self, user_key: &str) -> String {
        format!("{}{}", self.base, user_key)
    }

    /// Returns the full keys for a batch of caller-supplied keys.
    pub fn keys<S: AsRef<str>>(&self, user_keys: &[S]) -> Vec<String> {
        user_keys.iter().map(|k| self.key(k.as_ref())).collect()
    }

    /// Returns the match pattern for a caller-supplied glob.
    pub fn pattern(&self, user_pattern: &str) -> String {
        self.key(user_pattern)
    }

    /// Returns the glob matching every key of this component.
    pub fn all(&self) -> String {
        self.key("*")
    }

    /// Returns the secondary index key `{prefix}{component}user:{user_id}`.
    pub fn user_index_key(&self, user_id: &str) -> String {
        format!("{}{}{}", self.base, USER_INDEX_SEGMENT, user_id)
    }

    /// Returns true if `full_key` is a secondary user index of this component.
    pub fn is_user_index_key(&self, full_key: &str) -> bool {
        full_key
            .strip_prefix(self.base.as_str())
            .is_some_and(|rest| rest.starts_with(USER_INDEX_SEGMENT))
    }

    /// Strips `{prefix}{component}` from a full key.
    ///
    /// Keys outside this key space are returned unchanged.
    pub fn strip<'a>(&self, full_key: &'a str) -> &'a str {
        full_key.strip_prefix(self.base.as_str()).unwrap_or(full_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions() -> KeySpace {
        KeySpace::new("gopro:", "session:")
    }

    #[test]
    fn test_root_key() {
        let keys = KeySpace::root("gopro:");
        assert_eq!(keys.key("user:1"), "gopro:user:1");
        assert_eq!(keys.base(), "gopro:");
    }

    #[test]
    fn test_component_key() {
        assert_eq!(sessions().key("s1"), "gopro:session:s1");
        assert_eq!(KeySpace::new("gopro:", "lock:").key("k"), "gopro:lock:k");
        assert_eq!(
            KeySpace::new("gopro:", "ratelimit:").key("u1"),
            "gopro:ratelimit:u1"
        );
        assert_eq!(
            KeySpace::new("gopro:", "pubsub:").key("events"),
            "gopro:pubsub:events"
        );
    }

    #[test]
    fn test_user_index_key() {
        assert_eq!(sessions().user_index_key("u7"), "gopro:session:user:u7");
        assert!(sessions().is_user_index_key("gopro:session:user:u7"));
        assert!(!sessions().is_user_index_key("gopro:session:s1"));
        assert!(!sessions().is_user_index_key("other:session:user:u7"));
    }

    #[test]
    fn test_strip() {
        let keys = sessions();
        assert_eq!(keys.strip("gopro:session:s1"), "s1");
        assert_eq!(keys.strip("unrelated"), "unrelated");
    }

    #[test]
    fn test_strip_then_key_roundtrip() {
        let keys = KeySpace::root("gopro:");
        let full = keys.key("a:b:c");
        assert_eq!(keys.key(keys.strip(&full)), full);
    }

    #[test]
    fn test_pattern_and_all() {
        assert_eq!(sessions().all(), "gopro:session:*");
        assert_eq!(sessions().pattern("abc*"), "gopro:session:abc*");
    }

    #[test]
    fn test_keys_batch() {
        let keys = KeySpace::root("p:");
        assert_eq!(keys.keys(&["a", "b"]), vec!["p:a", "p:b"]);
    }
}
