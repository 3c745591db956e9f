//! Error types for safever

use thiserror::Error;

/// Main error type for safever operations
#[derive(Error, Debug)]
pub enum SafeverError {
    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("Catalog load failed: {0}")]
    CatalogLoad(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Rate limit exhausted for {0}")]
    RateLimited(String),

    #[error("Vulnerability database error: {0}")]
    Database(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for safever operations
pub type Result<T> = std::result::Result<T, SafeverError>;
