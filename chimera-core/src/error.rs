//! Error types for memory operations

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Error types for the memory core
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Rejected input (empty or oversized content); never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// A gateway call exceeded its deadline
    #[error("Query timed out after {elapsed_ms}ms: {query}")]
    Timeout {
        /// Query kind that timed out
        query: &'static str,
        /// Time spent before giving up
        elapsed_ms: u64,
    },

    /// Gateway retries exhausted, or the backend reported a permanent failure
    #[error("Persistence failure after {attempts} attempt(s): {message}")]
    PersistenceFailure {
        /// Number of tries made
        attempts: usize,
        /// Last backend error message
        message: String,
    },

    /// Operation invoked before `initialize()` completed or after `shutdown()`
    #[error("Memory actor is not initialized")]
    NotInitialized,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage backend error outside of a gateway call (connect, schema)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Short machine-readable label, used in event payloads and logs
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::Validation(_) => "validation",
            MemoryError::Timeout { .. } => "timeout",
            MemoryError::PersistenceFailure { .. } => "persistence_failure",
            MemoryError::NotInitialized => "not_initialized",
            MemoryError::Configuration(_) => "configuration",
            MemoryError::Backend(_) => "backend",
            MemoryError::Serialization(_) => "serialization",
            MemoryError::Io(_) => "io",
            MemoryError::Other(_) => "other",
        }
    }
}

impl From<String> for MemoryError {
    fn from(s: String) -> Self {
        MemoryError::Other(s)
    }
}

impl From<&str> for MemoryError {
    fn from(s: &str) -> Self {
        MemoryError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for MemoryError {
    fn from(err: anyhow::Error) -> Self {
        MemoryError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::PersistenceFailure {
            attempts: 3,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Persistence failure after 3 attempt(s): connection refused"
        );

        let err = MemoryError::Timeout {
            query: "upsert_long_term",
            elapsed_ms: 30_000,
        };
        assert!(err.to_string().contains("upsert_long_term"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(MemoryError::NotInitialized.kind(), "not_initialized");
        assert_eq!(MemoryError::Validation("empty".into()).kind(), "validation");
        assert_eq!(MemoryError::from("boom").kind(), "other");
    }
}
