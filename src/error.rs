//! Error types for the Turnstile service.

use thiserror::Error;

use crate::ratelimit::BackendError;

/// Main error type for Turnstile operations.
///
/// A rate-limit denial is not represented here: it is a normal verdict
/// outcome (see [`crate::admission::TooManyRequests`]).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit configuration that can never be applied (zero window or limit)
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfiguration(String),

    /// The shared counter store could not serve an administrative operation
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(#[from] BackendError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
