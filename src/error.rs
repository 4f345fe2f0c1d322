//! Centralized error types for Trellis

use thiserror::Error;

/// Edge router error types
#[derive(Debug, Error)]
pub enum EdgeError {
    /// Application or frontend/backend validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration problem (bad backend kind, unusable options)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovery source unreachable or returned garbage
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Origin 5xx or unreachable — maps to 502 for the client
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Cache tier read/write failure (not a cache miss)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Client sent something unparseable
    #[error("Client error: {0}")]
    Client(String),

    /// TLS configuration or certificate loading error
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP request or response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, EdgeError>;
