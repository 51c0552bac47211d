//! Error types for tentative operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Cache key construction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Procedure name must not be empty")]
    EmptyProcedure,

    #[error("Arguments for {procedure} are not serializable: {reason}")]
    Serialization { procedure: String, reason: String },
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cache store lock poisoned")]
    LockPoisoned,
}

/// Category of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteFailureKind {
    /// The server refused the request (validation, authorization, conflict).
    Rejected,
    /// The transport could not reach the server.
    Unavailable,
    /// No response within the allotted time.
    Timeout,
    /// The queried resource does not exist.
    NotFound,
}

impl fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::NotFound => "not found",
        };
        f.write_str(s)
    }
}

/// Structured failure returned by the remote procedure transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Remote call {procedure} failed ({kind}): {message}")]
pub struct RemoteFailure {
    pub procedure: String,
    pub kind: RemoteFailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(
        procedure: impl Into<String>,
        kind: RemoteFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn rejected(procedure: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(procedure, RemoteFailureKind::Rejected, message)
    }

    pub fn unavailable(procedure: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(procedure, RemoteFailureKind::Unavailable, message)
    }

    pub fn timeout(procedure: impl Into<String>) -> Self {
        Self::new(procedure, RemoteFailureKind::Timeout, "no response")
    }

    pub fn not_found(procedure: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(procedure, RemoteFailureKind::NotFound, message)
    }

    /// Transport-level failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RemoteFailureKind::Unavailable | RemoteFailureKind::Timeout
        )
    }
}

/// Errors surfaced by a mutation lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Optimistic transform failed for {key}: {reason}")]
    Transform { key: String, reason: String },

    #[error("Invalid arguments for {procedure}: {reason}")]
    InvalidArgs { procedure: String, reason: String },

    #[error("Remote failure: {0}")]
    Remote(#[from] RemoteFailure),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mutation {mutation_id} aborted before settling")]
    Aborted { mutation_id: Uuid },
}

impl MutationError {
    /// A remote failure is a business-level outcome: the cache has already
    /// been restored when the caller sees it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or TENTATIVE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all tentative errors.
#[derive(Debug, Error)]
pub enum TentativeError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for tentative operations.
pub type TentativeResult<T> = Result<T, TentativeError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failure_display() {
        let err = RemoteFailure::rejected("todo.toggle", "item locked");
        let msg = format!("{}", err);
        assert!(msg.contains("todo.toggle"));
        assert!(msg.contains("rejected"));
        assert!(msg.contains("item locked"));
    }

    #[test]
    fn test_remote_failure_retryable() {
        assert!(RemoteFailure::timeout("q").is_retryable());
        assert!(RemoteFailure::unavailable("q", "offline").is_retryable());
        assert!(!RemoteFailure::rejected("q", "nope").is_retryable());
        assert!(!RemoteFailure::not_found("q", "gone").is_retryable());
    }

    #[test]
    fn test_mutation_error_display_transform() {
        let err = MutationError::Transform {
            key: "todo.list:null".to_string(),
            reason: "item missing".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("todo.list:null"));
        assert!(msg.contains("item missing"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_mutation_error_from_variants() {
        let remote = MutationError::from(RemoteFailure::timeout("q"));
        assert!(matches!(remote, MutationError::Remote(_)));
        assert!(remote.is_recoverable());

        let store = MutationError::from(StoreError::LockPoisoned);
        assert!(matches!(store, MutationError::Store(_)));
    }

    #[test]
    fn test_tentative_error_from_variants() {
        let key = TentativeError::from(KeyError::EmptyProcedure);
        assert!(matches!(key, TentativeError::Key(_)));

        let store = TentativeError::from(StoreError::LockPoisoned);
        assert!(matches!(store, TentativeError::Store(_)));

        let mutation = TentativeError::from(MutationError::Aborted {
            mutation_id: Uuid::nil(),
        });
        assert!(matches!(mutation, TentativeError::Mutation(_)));

        let config = TentativeError::from(ConfigError::MissingConfigPath);
        assert!(matches!(config, TentativeError::Config(_)));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "refetch_timeout_ms",
            reason: "must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("refetch_timeout_ms"));
        assert!(msg.contains("must be > 0"));
    }
}
