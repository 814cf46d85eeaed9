use thiserror::Error;

/// Errors that can occur during coordination-layer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not present or has expired.
    #[error("cache miss: {key}")]
    Miss { key: String },

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    /// Unlock or extend was attempted on a lock that does not exist.
    #[error("lock not held: {key}")]
    LockNotHeld { key: String },

    /// The stored lock token differs from the caller's token.
    #[error("lock token mismatch: {key}")]
    TokenMismatch { key: String },

    #[error("lock {key} not acquired after {attempts} attempts")]
    AttemptsExhausted { key: String, attempts: u32 },

    #[error("operation timed out: {op}")]
    Timeout { op: String },

    #[error("Cache connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Cache operation failed: {0}")]
    OperationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("health check failed for {component}: {reason}")]
    HealthCheck {
        component: &'static str,
        reason: String,
    },

    #[error("client closed")]
    Closed,
}

/// Coarse classification of [`CacheError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Miss,
    Conflict,
    PreconditionFailed,
    Timeout,
    Transport,
    Encoding,
    InvariantViolation,
    InvalidArgument,
    Closed,
}

impl CacheError {
    pub fn miss(key: impl Into<String>) -> Self {
        Self::Miss { key: key.into() }
    }

    pub fn timeout(op: impl Into<String>) -> Self {
        Self::Timeout { op: op.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Miss { .. } | Self::SessionNotFound { .. } => ErrorKind::Miss,
            Self::TokenMismatch { .. } | Self::AttemptsExhausted { .. } => ErrorKind::Conflict,
            Self::LockNotHeld { .. } => ErrorKind::PreconditionFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionFailed(_)
            | Self::PoolExhausted(_)
            | Self::OperationFailed(_)
            | Self::HealthCheck { .. } => ErrorKind::Transport,
            Self::Serialization(_) | Self::Deserialization(_) => ErrorKind::Encoding,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Closed => ErrorKind::Closed,
        }
    }

    pub fn is_miss(&self) -> bool {
        self.kind() == ErrorKind::Miss
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// True for unlock-with-value mismatches and for operations on missing locks
    /// or sessions that required prior existence.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self,
            Self::LockNotHeld { .. } | Self::TokenMismatch { .. } | Self::SessionNotFound { .. }
        )
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
