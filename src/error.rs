//! Error types for trustlink

use thiserror::Error;

/// Result type alias for trustlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trustlink
///
/// Protocol outcomes (bad signature, unknown device, duplicate registration)
/// are returned as values, not errors. An `Err` is either invalid input or a
/// backend that could not be reached.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or malformed input
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown or already-consumed pairing token
    #[error("invalid pairing token: {0}")]
    InvalidToken(String),

    /// Resource already claimed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// Authorization provider (OAuth) error
    #[error("provider error: {0}")]
    Provider(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
