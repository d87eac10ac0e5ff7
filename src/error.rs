//! Error types for the extraction pipeline.
//!
//! This module provides structured error handling with:
//! - `AppError`: Domain-specific errors for pipeline operations
//! - `Result<T>`: Type alias for Results using AppError
//!
//! Retryability is a property of the error kind (`is_retryable`), never of
//! the error message.

use thiserror::Error;

// ============================================================================
// DOMAIN ERROR TYPE
// ============================================================================

/// Domain-specific errors for pipeline operations.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or malformed URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Network request failed (connection reset, DNS, transport)
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream returned an HTTP error status
    #[error("HTTP {status} from {service}")]
    HttpStatus { service: &'static str, status: u16 },

    /// Daily quota for a domain is exhausted
    #[error("Rate limit exceeded for {domain}: {limit} requests per day. Resets in {reset_in} seconds.")]
    RateLimitExceeded {
        domain: String,
        limit: u32,
        reset_in: i64,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// LLM backend failed
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM produced JSON that could not be parsed or repaired
    #[error("Malformed LLM JSON: {0}")]
    MalformedJson(String),

    /// Embedding backend failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector index operation failed
    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// Operation exceeded its deadline
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Job was cancelled
    #[error("Job cancelled")]
    Cancelled,

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create an LLM error
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Create an embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create a vector index error
    pub fn vector(msg: impl Into<String>) -> Self {
        Self::VectorIndex(msg.into())
    }

    /// Whether the retry helper may repeat the failed operation.
    ///
    /// Transient transport failures, 5xx statuses and timeouts are
    /// retryable; malformed input, quota exhaustion and cancellation are
    /// not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            Self::Llm(_) | Self::MalformedJson(_) => true,
            Self::Embedding(_) | Self::VectorIndex(_) => true,
            Self::Redis(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;
