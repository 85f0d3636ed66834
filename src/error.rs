//! Error types for fedcore
//!
//! All fallible operations in the crate return `AppError`.
//! Signature verification has its own typed result,
//! [`VerificationError`](crate::federation::VerificationError), so that a
//! bad signature is never confused with a missing actor.

use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Reference resolves to nothing, or the result was filtered out
    #[error("Actor not found")]
    NotFound,

    /// Remote actor document or webfinger fetch failed at the network level
    #[error("Remote fetch failed: {message}")]
    RemoteFetch { transient: bool, message: String },

    /// Remote actor document has the wrong shape
    #[error("Malformed actor document: {0}")]
    MalformedDocument(String),

    /// `Signature` header could not be parsed
    #[error("Malformed Signature header: {0}")]
    MalformedSignatureHeader(String),

    /// Key material is corrupt or key generation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Outbound destination URI is unusable
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Outbound delivery failed
    #[error("Delivery error: {message}")]
    Delivery {
        retryable: bool,
        status: Option<u16>,
        message: String,
    },

    /// Outbound queue is at capacity
    #[error("Delivery queue is full")]
    QueueFull,

    /// Outbound queue has no consumers left
    #[error("Delivery queue is closed")]
    QueueClosed,

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::RemoteFetch {
                transient: true, ..
            } => "remote_fetch_transient",
            AppError::RemoteFetch { .. } => "remote_fetch_permanent",
            AppError::MalformedDocument(_) => "malformed_document",
            AppError::MalformedSignatureHeader(_) => "malformed_signature_header",
            AppError::Crypto(_) => "crypto",
            AppError::InvalidDestination(_) => "invalid_destination",
            AppError::Delivery {
                retryable: true, ..
            } => "delivery_retryable",
            AppError::Delivery { .. } => "delivery_permanent",
            AppError::QueueFull => "queue_full",
            AppError::QueueClosed => "queue_closed",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RemoteFetch {
                transient: true, ..
            } | AppError::Delivery {
                retryable: true, ..
            }
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
