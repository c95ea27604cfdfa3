//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<livefeed_ws::WsError>),

    #[error("Feed error: {0}")]
    Feed(#[from] livefeed_feed::FeedError),

    #[error("Invalid symbol: {0}")]
    Symbol(#[from] livefeed_core::CoreError),
}

impl From<livefeed_ws::WsError> for AppError {
    fn from(e: livefeed_ws::WsError) -> Self {
        AppError::WebSocket(Box::new(e))
    }
}

pub type AppResult<T> = Result<T, AppError>;
