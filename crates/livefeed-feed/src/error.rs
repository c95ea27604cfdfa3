//! Feed error types.

use thiserror::Error;

/// Errors raised by stream and REST price sources.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Aggregator stopped")]
    AggregatorStopped,
}

pub type FeedResult<T> = Result<T, FeedError>;
