//! Error types for cache operations.

use std::time::Duration;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur while talking to either cache tier.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A value could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the codec failure.
        message: String,
    },

    /// The key (or hash field) is absent from the tier.
    #[error("Key not found: {key}")]
    NotFound {
        /// The logical key that was looked up.
        key: String,
    },

    /// A connection could not be checked out of the Redis pool.
    #[error("Redis pool error: {message}")]
    Pool {
        /// Description of the pool failure.
        message: String,
    },

    /// Redis answered with an error or the transport failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A client-side deadline elapsed.
    #[error("Redis {operation} timed out after {timeout:?}")]
    Timeout {
        /// The command or pool operation that timed out.
        operation: &'static str,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// Distributed lock failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors raised by the distributed mutex.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// All acquisition attempts found the lock held by someone else.
    #[error("lock '{name}' not acquired after {tries} attempts")]
    NotAcquired { name: String, tries: u32 },

    /// The acquisition deadline elapsed.
    #[error("timed out acquiring lock '{name}' after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// `lock` was called on a handle that already holds (or is acquiring) the lock.
    #[error("lock '{name}' is already held by this handle")]
    AlreadyHeld { name: String },

    /// The operation needs a held lock but this handle holds none.
    #[error("lock '{name}' is not held by this handle")]
    NotHeld { name: String },
}

impl CacheError {
    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Pool` error.
    #[must_use]
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    /// Creates a new `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns `true` if the key was absent from the tier.
    ///
    /// Only the store's "key absent" reply maps here; connection failures never do.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for network, pool and timeout failures.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Pool { .. } | Self::Redis(_) | Self::Timeout { .. }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Pool { .. } | Self::Redis(_) | Self::Timeout { .. } => {
                ErrorCategory::Infrastructure
            }
            Self::Lock(_) => ErrorCategory::Lock,
            Self::Config(_) => ErrorCategory::Configuration,
        }
    }
}

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Serialization,
    NotFound,
    Infrastructure,
    Lock,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serialization => "serialization",
            Self::NotFound => "not_found",
            Self::Infrastructure => "infrastructure",
            Self::Lock => "lock",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
