//! Crate-wide error types

use thiserror::Error;

/// Errors that can occur in grid trading operations
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Price tick rejected after trying {attempts} candidate ticks")]
    TickMismatch { attempts: usize },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Partial placement rolled back: {placed} of {requested} orders were live")]
    PartialPlacement { placed: usize, requested: usize },

    #[error("Cancel unverified, orders still open: {0:?}")]
    CancelUnverified(Vec<String>),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Event channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Config(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
