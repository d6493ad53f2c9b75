//! Error types for the Glint enrichment worker.
//!
//! The split matters for the job loop: `ProviderError` carries the message
//! the transient-vs-fatal classifier inspects, while `WorkerError` is the
//! umbrella for everything that can escape one enrichment job.

use thiserror::Error;

/// Failure of a VLM provider operation: transport, HTTP status, or an error
/// the model service reported in an otherwise well-formed response body.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable failure description, inspected by the classifier
    pub message: String,
    /// HTTP status when the failure came from a non-2xx response
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Error for an operation a provider does not implement at all.
    ///
    /// The message wording is load-bearing: callers use [`is_unsupported`]
    /// to skip the operation for the rest of the job.
    ///
    /// [`is_unsupported`]: ProviderError::is_unsupported
    pub fn unsupported(operation: &str, provider: &str) -> Self {
        Self::new(format!(
            "{operation} is not supported by the {provider} provider"
        ))
    }

    /// Station-side queue pressure and timeouts are worth re-queueing;
    /// everything else poisons the job.
    pub fn is_transient(&self) -> bool {
        let msg = self.message.to_lowercase();
        ["queue is full", "rejected", "timeout", "timed out"]
            .iter()
            .any(|needle| msg.contains(needle))
    }

    /// Whether the operation is missing from the provider surface entirely
    /// (as opposed to having failed this once).
    pub fn is_unsupported(&self) -> bool {
        let msg = self.message.to_lowercase();
        msg.contains("not supported") || msg.contains("not available")
    }
}

/// Embedding failures are confined to the embedding module; they are logged
/// and swallowed, never propagated into a job result.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct EmbeddingError(pub String);

/// Any error that can escape a single enrichment job.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias for worker results.
pub type Result<T> = std::result::Result<T, WorkerError>;
