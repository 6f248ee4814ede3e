//! Error types for Inbox Pilot.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Digest error: {0}")]
    Digest(#[from] DigestError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to read secret from {path}: {reason}")]
    Secret { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connection or protocol failure. Retryable with backoff.
    #[error("Source {account} unavailable: {reason}")]
    Unavailable { account: String, reason: String },

    #[error("Source {account} does not support {action}")]
    Unsupported { account: String, action: String },

    #[error("Message {source_ref} not found in {account}/{folder}")]
    NotFound {
        account: String,
        folder: String,
        source_ref: String,
    },

    #[error("Failed to parse message from {account}: {reason}")]
    Parse { account: String, reason: String },

    #[error("Forward via {account} failed: {reason}")]
    Forward { account: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether the poller should back off and try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io(_))
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification pipeline errors. The pipeline fails closed.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Provider call failed: {0}")]
    Provider(#[from] LlmError),

    #[error("Malformed classification output: {reason}")]
    Malformed { reason: String, raw: String },

    #[error("Context budget exceeded: {used} tokens estimated, {limit} allowed")]
    BudgetExceeded { used: usize, limit: usize },
}

impl ClassificationError {
    /// Provider failures may succeed on retry; bad output or budget overruns won't.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(LlmError::RequestFailed { .. } | LlmError::RateLimited { .. })
        )
    }
}

/// Audit store errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A second `processed` record for the same message id.
    #[error("Message {message_id} already has a processed audit entry")]
    Duplicate { message_id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Digest generation and delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Benign: not enough processed messages in the window.
    #[error("Insufficient data for digest: {found} emails, {required} required")]
    InsufficientData { found: usize, required: usize },

    #[error("Delivery via {sink} failed: {reason}")]
    Delivery { sink: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
