//! Error types for the Membase domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Membase operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Local persistence ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Consolidation ---
    #[error("Summarization error: {0}")]
    Summarization(#[from] SummarizationError),

    // --- Remote mirroring ---
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    // --- LLM providers ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Knowledge index ---
    #[error("Knowledge index error: {0}")]
    Knowledge(#[from] KnowledgeError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the tiered message store.
///
/// A failed call never consumes a memory index.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Wrong value, missing required field, unknown wire tag.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage unavailable or the write could not be committed.
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// A stored record could not be decoded back into a message.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Error)]
pub enum SummarizationError {
    #[error("Model call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Model output is not valid {schema}: {reason}")]
    InvalidOutput { schema: &'static str, reason: String },

    #[error("Empty batch")]
    EmptyBatch,
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Upload of {id} failed: {source}")]
    Upload {
        id: String,
        #[source]
        source: HubError,
    },

    #[error("Sync queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Hub returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected hub response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum KnowledgeError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Document rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_displays_kind() {
        let err = Error::Store(StoreError::Persistence("disk full".into()));
        assert!(err.to_string().contains("Persistence failed"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn sync_error_keeps_hub_source() {
        let err = SyncError::Upload {
            id: "conv_3".into(),
            source: HubError::Status {
                status: 503,
                body: "unavailable".into(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("conv_3"));
        assert!(text.contains("503"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn provider_error_converts_to_summarization_error() {
        let err: SummarizationError = ProviderError::Network("timeout".into()).into();
        assert!(matches!(err, SummarizationError::Provider(_)));
        assert!(err.to_string().contains("timeout"));
    }
}
