//! Error types for Turnstile.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The shared state store could not be reached or timed out
    #[error("State store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Optimistic update retries were exhausted for one client
    #[error("Contention on client '{client_id}': gave up after {attempts} conflicting updates")]
    Contention { client_id: String, attempts: u32 },

    /// Limiter parameters rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Client identifiers must be non-empty
    #[error("Client id must not be empty")]
    InvalidClientId,

    /// The stored bucket state could not be decoded
    #[error("Corrupt bucket state at '{key}': {reason}")]
    CorruptState { key: String, reason: String },

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
