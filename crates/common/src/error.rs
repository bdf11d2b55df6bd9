//! Common error types.

use thiserror::Error;

/// Main error type for the compositor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type CompositorResult<T> = Result<T, CompositorError>;

impl CompositorError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn out_of_resources(msg: impl Into<String>) -> Self {
        Self::OutOfResources(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
