//! Error types for the transition engine.
//!
//! Only infrastructure failures live here. Faults raised by a routine's own
//! logic are captured as [`crate::types::TaskResult::Faulted`] and travel as
//! ordinary completion data.

use crate::types::ETag;

/// The result type used throughout fabric-core.
pub type Result<T> = std::result::Result<T, FabricError>;

/// Infrastructure errors raised by the engine, its contracts and backends.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// A state write carried a stale precondition. Nothing was written.
    #[error("etag mismatch on {key}: expected {expected:?}, found {actual:?}")]
    ETagMismatch {
        key: String,
        expected: Option<ETag>,
        actual: Option<ETag>,
    },

    /// No paused routine state exists for the key.
    #[error("routine state not found: {key}")]
    StateNotFound { key: String },

    /// Unresolvable or ambiguous routing, duplicate registrations, bad config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The active connector does not advertise the requested capability.
    #[error("connector '{connector}' does not support {operation}")]
    Unsupported {
        connector: String,
        operation: &'static str,
    },

    /// Network failures, unavailable backends, exhausted interactive retries.
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A physical resource (queue, table) does not exist yet.
    #[error("resource missing: {0}")]
    ResourceMissing(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A routine adapter could not restore or capture its state.
    #[error("routine error in {routine}: {message}")]
    Routine { routine: String, message: String },

    #[error("fabric is shutting down")]
    Shutdown,
}

impl FabricError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Optimistic concurrency conflict: re-read and replay the whole transition.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ETagMismatch { .. })
    }

    /// Errors that a later attempt may succeed on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ETagMismatch { .. } | Self::Transient { .. } | Self::ResourceMissing(_)
        )
    }
}
