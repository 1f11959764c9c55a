//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No adapter is registered under the requested name.
    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
