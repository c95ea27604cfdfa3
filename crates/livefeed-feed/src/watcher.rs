//! Single-symbol last-price watcher.

use crate::error::FeedResult;
use crate::poller::{spawn_poller, PollHandle, PollSink};
use crate::rest::{LastPrice, LastPriceSource};
use chrono::Utc;
use livefeed_core::{is_observable_price, Symbol};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Default refresh interval of the watcher.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(2000);

/// Fetch status of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObservationStatus {
    #[default]
    Idle,
    Loading,
    Error,
}

/// Latest known price of the watched symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PriceObservation {
    pub price: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    pub status: ObservationStatus,
    pub error: Option<String>,
}

struct ObservationSink {
    tx: watch::Sender<PriceObservation>,
}

impl PollSink for ObservationSink {
    fn fetch_started(&self, _symbol: &Symbol) {
        self.tx.send_if_modified(|obs| {
            if obs.price.is_some() || obs.status == ObservationStatus::Loading {
                return false;
            }
            obs.status = ObservationStatus::Loading;
            true
        });
    }

    fn fetched(&self, symbol: &Symbol, result: FeedResult<Option<LastPrice>>) {
        self.tx.send_if_modified(|obs| {
            let before = obs.clone();
            match result {
                Ok(last) => {
                    if let Some(last) = last.filter(|l| is_observable_price(l.price)) {
                        obs.price = Some(last.price);
                        obs.timestamp = Some(last.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()));
                    }
                    obs.status = ObservationStatus::Idle;
                    obs.error = None;
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "Last price fetch failed");
                    obs.status = ObservationStatus::Error;
                    obs.error = Some(e.to_string());
                }
            }
            *obs != before
        });
    }
}

/// Polls the last price of one symbol and publishes it over a watch channel.
///
/// Polling stops when the watcher is dropped or `stop` is called.
pub struct LastPriceWatcher {
    rx: watch::Receiver<PriceObservation>,
    poll: PollHandle,
}

impl LastPriceWatcher {
    pub fn spawn(symbol: Symbol, source: Arc<dyn LastPriceSource>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(PriceObservation::default());
        let poll = spawn_poller(symbol, source, interval, Arc::new(ObservationSink { tx }));
        Self { rx, poll }
    }

    pub fn symbol(&self) -> &Symbol {
        self.poll.symbol()
    }

    pub fn current(&self) -> PriceObservation {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PriceObservation> {
        self.rx.clone()
    }

    pub fn stop(&self) {
        self.poll.cancel();
    }
}
