//! livefeed runner.
//!
//! Wires the components into one process:
//! - Shared WebSocket trade feed for the configured socket symbols
//! - Stream-or-poll price aggregator for the configured aggregator symbols
//! - Optional single-symbol last-price watcher

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
