//! Prometheus metrics and structured logging for livefeed.
//!
//! - Prometheus metrics for connection state, ticks, fallbacks and polling
//! - Structured logging with tracing (JSON in production, pretty otherwise)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
