//! Multi-symbol price aggregation.
//!
//! `PriceAggregator` owns one feed per desired symbol: a server-push
//! stream when one can be opened, otherwise a REST poller. A stream that
//! fails at runtime is closed and replaced by a poller for the same
//! symbol. All feeds write into a shared `PriceBook`.
//!
//! Reconciliation is synchronous (`set_symbols`, `handle_stream_failure`)
//! so it can be driven directly in tests; `spawn` wraps it in an actor
//! task driven by an `AggregatorHandle`.

use crate::error::{FeedError, FeedResult};
use crate::poller::{spawn_poller, PollHandle};
use crate::price_book::{PriceBook, PriceMap};
use crate::rest::LastPriceSource;
use crate::stream::{PriceStream, PriceStreamSource, StreamUpdate};
use livefeed_core::{normalize_symbols, Symbol, DEFAULT_SYMBOL_PREFIX};
use livefeed_telemetry::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling interval used when a symbol has no stream.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

const COMMAND_BUFFER: usize = 32;

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Only symbols starting with this prefix are aggregated.
    pub symbol_prefix: String,
    pub poll_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            symbol_prefix: DEFAULT_SYMBOL_PREFIX.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Kind of feed currently serving a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Stream,
    Poll,
}

/// Per-symbol feed.
#[derive(Debug)]
enum SymbolFeed {
    Stream { id: u64, cancel: CancellationToken },
    Poll(PollHandle),
}

impl SymbolFeed {
    fn kind(&self) -> FeedKind {
        match self {
            SymbolFeed::Stream { .. } => FeedKind::Stream,
            SymbolFeed::Poll(_) => FeedKind::Poll,
        }
    }

    fn close(&self) {
        match self {
            SymbolFeed::Stream { cancel, .. } => cancel.cancel(),
            SymbolFeed::Poll(handle) => handle.cancel(),
        }
    }
}

/// Runtime failure of a stream, reported by its pump task.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub symbol: Symbol,
    /// Identifies the stream instance; failures of replaced streams are ignored.
    pub stream_id: u64,
    pub reason: String,
}

#[derive(Debug)]
enum AggregatorCommand {
    SetSymbols(Vec<String>),
    Shutdown,
}

/// Reconciles a desired symbol list against live per-symbol feeds.
pub struct PriceAggregator {
    config: AggregatorConfig,
    streams: Arc<dyn PriceStreamSource>,
    prices: Arc<dyn LastPriceSource>,
    book: PriceBook,
    desired: Vec<Symbol>,
    feeds: HashMap<Symbol, SymbolFeed>,
    next_stream_id: u64,
    failure_tx: mpsc::UnboundedSender<StreamFailure>,
    failure_rx: mpsc::UnboundedReceiver<StreamFailure>,
}

impl PriceAggregator {
    pub fn new(
        config: AggregatorConfig,
        streams: Arc<dyn PriceStreamSource>,
        prices: Arc<dyn LastPriceSource>,
    ) -> Self {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        Self {
            config,
            streams,
            prices,
            book: PriceBook::new(),
            desired: Vec::new(),
            feeds: HashMap::new(),
            next_stream_id: 0,
            failure_tx,
            failure_rx,
        }
    }

    pub fn book(&self) -> &PriceBook {
        &self.book
    }

    /// Normalized desired symbols, sorted.
    pub fn desired(&self) -> &[Symbol] {
        &self.desired
    }

    pub fn feed_kind(&self, symbol: &str) -> Option<FeedKind> {
        self.feeds.get(symbol).map(SymbolFeed::kind)
    }

    pub fn active_feeds(&self) -> usize {
        self.feeds.len()
    }

    /// Reconcile feeds with a new symbol list.
    ///
    /// The list is trimmed, uppercased, filtered to the configured prefix,
    /// deduplicated and sorted before diffing against the active feeds.
    pub fn set_symbols<I, S>(&mut self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = normalize_symbols(symbols, &self.config.symbol_prefix);

        let removed: Vec<Symbol> = self
            .feeds
            .keys()
            .filter(|s| next.binary_search(*s).is_err())
            .cloned()
            .collect();
        for symbol in &removed {
            if let Some(feed) = self.feeds.remove(symbol) {
                feed.close();
                debug!(%symbol, kind = ?feed.kind(), "Feed removed");
            }
        }

        self.book.retain(&next);
        self.book.track(&next);

        let added: Vec<Symbol> = next
            .iter()
            .filter(|s| !self.feeds.contains_key(*s))
            .cloned()
            .collect();
        for symbol in added {
            self.start_feed(symbol);
        }

        if !removed.is_empty() || self.desired != next {
            info!(symbols = ?next.iter().map(Symbol::as_str).collect::<Vec<_>>(), "Desired symbols updated");
        }
        self.desired = next;
        self.report_feeds();
    }

    /// Replace a failed stream with a poller.
    ///
    /// Ignored unless the failure belongs to the stream currently serving
    /// the symbol.
    pub fn handle_stream_failure(&mut self, failure: StreamFailure) {
        let current = match self.feeds.get(&failure.symbol) {
            Some(SymbolFeed::Stream { id, .. }) => *id,
            _ => return,
        };
        if current != failure.stream_id {
            return;
        }

        if let Some(feed) = self.feeds.remove(&failure.symbol) {
            feed.close();
        }
        warn!(
            symbol = %failure.symbol,
            reason = %failure.reason,
            "Stream failed, falling back to polling"
        );
        Metrics::fallback_activated("stream_error");
        self.start_poll(failure.symbol);
        self.report_feeds();
    }

    /// Wait for the next stream failure report.
    pub async fn next_failure(&mut self) -> Option<StreamFailure> {
        self.failure_rx.recv().await
    }

    /// Close every stream, cancel every poller and forget all symbols.
    pub fn shutdown(&mut self) {
        for (_, feed) in self.feeds.drain() {
            feed.close();
        }
        self.desired.clear();
        self.report_feeds();
    }

    /// Run as an actor task.
    pub fn spawn(self) -> (AggregatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = AggregatorHandle {
            tx,
            book: self.book.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<AggregatorCommand>) {
        info!("Price aggregator started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(AggregatorCommand::SetSymbols(symbols)) => self.set_symbols(symbols),
                    Some(AggregatorCommand::Shutdown) | None => break,
                },
                Some(failure) = self.failure_rx.recv() => self.handle_stream_failure(failure),
            }
        }
        self.shutdown();
        info!("Price aggregator stopped");
    }

    fn start_feed(&mut self, symbol: Symbol) {
        match self.streams.open(&symbol) {
            Ok(stream) => {
                self.next_stream_id += 1;
                let id = self.next_stream_id;
                let cancel = stream.cancel_token();
                tokio::spawn(pump_stream(
                    symbol.clone(),
                    id,
                    stream,
                    self.book.clone(),
                    self.failure_tx.clone(),
                ));
                debug!(%symbol, stream_id = id, "Stream opened");
                self.feeds.insert(symbol, SymbolFeed::Stream { id, cancel });
            }
            Err(e) => {
                warn!(%symbol, error = %e, "Stream unavailable, polling instead");
                Metrics::fallback_activated("open_failed");
                self.start_poll(symbol);
            }
        }
    }

    fn start_poll(&mut self, symbol: Symbol) {
        let handle = spawn_poller(
            symbol.clone(),
            Arc::clone(&self.prices),
            self.config.poll_interval,
            Arc::new(self.book.clone()),
        );
        self.feeds.insert(symbol, SymbolFeed::Poll(handle));
    }

    fn report_feeds(&self) {
        let streams = self
            .feeds
            .values()
            .filter(|f| f.kind() == FeedKind::Stream)
            .count();
        Metrics::active_feeds(streams, self.feeds.len() - streams);
    }
}

impl Drop for PriceAggregator {
    fn drop(&mut self) {
        for feed in self.feeds.values() {
            feed.close();
        }
    }
}

async fn pump_stream(
    symbol: Symbol,
    stream_id: u64,
    mut stream: PriceStream,
    book: PriceBook,
    failures: mpsc::UnboundedSender<StreamFailure>,
) {
    let cancel = stream.cancel_token();
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            update = stream.next() => update,
        };

        let reason = match update {
            Some(StreamUpdate::Price(price)) => {
                book.update(&symbol, price, "stream");
                continue;
            }
            Some(StreamUpdate::Error(reason)) => reason,
            None => "stream closed".to_string(),
        };

        let _ = failures.send(StreamFailure {
            symbol,
            stream_id,
            reason,
        });
        return;
    }
}

/// Handle to a spawned aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorCommand>,
    book: PriceBook,
}

impl AggregatorHandle {
    pub async fn set_symbols<I, S>(&self, symbols: I) -> FeedResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = symbols.into_iter().map(|s| s.as_ref().to_string()).collect();
        self.tx
            .send(AggregatorCommand::SetSymbols(symbols))
            .await
            .map_err(|_| FeedError::AggregatorStopped)
    }

    /// Tear down every feed and stop the aggregator task.
    pub async fn shutdown(&self) -> FeedResult<()> {
        self.tx
            .send(AggregatorCommand::Shutdown)
            .await
            .map_err(|_| FeedError::AggregatorStopped)
    }

    pub fn book(&self) -> &PriceBook {
        &self.book
    }

    pub fn snapshot(&self) -> PriceMap {
        self.book.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PriceMap> {
        self.book.subscribe()
    }
}
