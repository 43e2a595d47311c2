//! Error types for the Floodgate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller passed an argument that can never be rate limited
    /// (empty identifier, empty action name).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Window store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Errors raised by a [`WindowStore`](crate::ratelimit::WindowStore).
///
/// The limiter never hands these to its callers from `check_limit`; they
/// are turned into a degraded, fail-open decision instead.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store did not answer within the configured command timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Redis transport or protocol error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store cannot serve requests at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
