//! Per-symbol last-price polling.
//!
//! The poller fetches immediately and then once per interval. Each fetch
//! runs in its own task so a slow request never holds back the next tick.
//! Once the handle is cancelled, in-flight fetches are abandoned and their
//! results never reach the sink.

use crate::error::FeedResult;
use crate::price_book::PriceBook;
use crate::rest::{LastPrice, LastPriceSource};
use livefeed_core::Symbol;
use livefeed_telemetry::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives poll results for one symbol.
pub trait PollSink: Send + Sync + 'static {
    /// Called before each fetch is issued.
    fn fetch_started(&self, _symbol: &Symbol) {}

    /// Called with the outcome of a fetch that completed before cancellation.
    fn fetched(&self, symbol: &Symbol, result: FeedResult<Option<LastPrice>>);
}

impl PollSink for PriceBook {
    fn fetched(&self, symbol: &Symbol, result: FeedResult<Option<LastPrice>>) {
        match result {
            Ok(Some(last)) => {
                self.update(symbol, last.price, "poll");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%symbol, error = %e, "Last price fetch failed");
                Metrics::poll_failed(symbol.as_str());
            }
        }
    }
}

/// Running poll loop. Dropping the handle cancels it.
#[derive(Debug)]
pub struct PollHandle {
    symbol: Symbol,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Stop polling. No fetch result is delivered after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start polling `source` for `symbol` every `interval`, reporting to `sink`.
pub fn spawn_poller<S>(
    symbol: Symbol,
    source: Arc<dyn LastPriceSource>,
    interval: Duration,
    sink: Arc<S>,
) -> PollHandle
where
    S: PollSink,
{
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poll_loop(
        symbol.clone(),
        source,
        interval,
        sink,
        cancel.clone(),
    ));

    debug!(%symbol, interval_ms = interval.as_millis() as u64, "Poller started");
    PollHandle {
        symbol,
        cancel,
        task,
    }
}

async fn poll_loop<S>(
    symbol: Symbol,
    source: Arc<dyn LastPriceSource>,
    interval: Duration,
    sink: Arc<S>,
    cancel: CancellationToken,
) where
    S: PollSink,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                sink.fetch_started(&symbol);
                tokio::spawn(fetch_once(
                    symbol.clone(),
                    Arc::clone(&source),
                    Arc::clone(&sink),
                    cancel.clone(),
                ));
            }
        }
    }

    debug!(%symbol, "Poller stopped");
}

async fn fetch_once<S>(
    symbol: Symbol,
    source: Arc<dyn LastPriceSource>,
    sink: Arc<S>,
    cancel: CancellationToken,
) where
    S: PollSink,
{
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = source.last_price(&symbol) => result,
    };
    if cancel.is_cancelled() {
        return;
    }
    sink.fetched(&symbol, result);
}
