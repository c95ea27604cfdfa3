//! Prometheus metrics for livefeed.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_int_gauge_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, IntGaugeVec,
    TextEncoder,
};

/// Feed socket connection state (1 = connected, 0 = disconnected).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("livefeed_ws_connected", "Feed socket connection state (1=connected)").unwrap()
});

/// Feed socket phase (1 for the active phase).
pub static WS_PHASE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "livefeed_ws_phase",
        "Feed socket state machine phase (1=active, 0=inactive)",
        &["phase"]
    )
    .unwrap()
});

/// Scheduled reconnects.
pub static WS_RECONNECT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("livefeed_ws_reconnect_total", "Total scheduled feed reconnects").unwrap()
});

/// Trade ticks accepted by the router.
pub static TICKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("livefeed_ticks_total", "Trade ticks received", &["symbol"]).unwrap()
});

/// Inbound frames or messages dropped.
pub static FRAMES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livefeed_frames_dropped_total",
        "Inbound frames or messages dropped",
        &["reason"]
    )
    .unwrap()
});

/// Price map updates by source (stream/poll).
pub static PRICE_UPDATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livefeed_price_updates_total",
        "Accepted price map updates",
        &["source"]
    )
    .unwrap()
});

/// Fallbacks from stream to polling.
pub static FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livefeed_fallback_total",
        "Per-symbol fallbacks from stream to polling",
        &["reason"]
    )
    .unwrap()
});

/// Failed last-price fetches.
pub static POLL_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "livefeed_poll_failures_total",
        "Failed last-price fetches",
        &["symbol"]
    )
    .unwrap()
});

/// Active per-symbol feeds by kind (stream/poll).
pub static ACTIVE_FEEDS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("livefeed_active_feeds", "Active per-symbol feeds", &["kind"])
        .unwrap()
});

const PHASES: [&str; 6] = [
    "idle",
    "connecting",
    "authenticating",
    "subscribed",
    "closing",
    "backoff",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    pub fn ws_connected() {
        WS_CONNECTED.set(1.0);
    }

    pub fn ws_disconnected() {
        WS_CONNECTED.set(0.0);
    }

    /// Mark `phase` active and every other phase inactive.
    pub fn ws_phase_set(phase: &str) {
        for p in PHASES {
            WS_PHASE.with_label_values(&[p]).set(0.0);
        }
        WS_PHASE.with_label_values(&[phase]).set(1.0);
    }

    pub fn ws_reconnect_scheduled() {
        WS_RECONNECT_TOTAL.inc();
    }

    pub fn tick_received(symbol: &str) {
        TICKS_TOTAL.with_label_values(&[symbol]).inc();
    }

    pub fn frame_dropped(reason: &str) {
        FRAMES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn price_updated(source: &str) {
        PRICE_UPDATES_TOTAL.with_label_values(&[source]).inc();
    }

    pub fn fallback_activated(reason: &str) {
        FALLBACK_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn poll_failed(symbol: &str) {
        POLL_FAILURES_TOTAL.with_label_values(&[symbol]).inc();
    }

    pub fn active_feeds(streams: usize, polls: usize) {
        ACTIVE_FEEDS.with_label_values(&["stream"]).set(streams as i64);
        ACTIVE_FEEDS.with_label_values(&["poll"]).set(polls as i64);
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buf)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_gauge_single_active() {
        Metrics::ws_phase_set("backoff");
        assert_eq!(WS_PHASE.with_label_values(&["backoff"]).get(), 1.0);
        assert_eq!(WS_PHASE.with_label_values(&["subscribed"]).get(), 0.0);

        Metrics::ws_phase_set("subscribed");
        assert_eq!(WS_PHASE.with_label_values(&["backoff"]).get(), 0.0);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        Metrics::fallback_activated("open_failed");
        let text = Metrics::render().unwrap();
        assert!(text.contains("livefeed_fallback_total"));
    }
}
