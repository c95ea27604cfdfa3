//! Error types for livefeed-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Empty symbol")]
    EmptySymbol,
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
