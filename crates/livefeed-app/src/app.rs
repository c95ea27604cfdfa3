//! Main application orchestration.

use crate::config::AppConfig;
use crate::error::AppResult;
use livefeed_core::Symbol;
use livefeed_feed::{
    AggregatorHandle, LastPriceClient, LastPriceSource, LastPriceWatcher, PriceAggregator,
    PriceMap, PriceObservation, SseStreamSource,
};
use livefeed_ws::{ConnectionManager, ConnectionPhase, FeedEvent, FeedFault, FeedHandle, WsResult};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the socket event channel.
const EVENT_BUFFER: usize = 1000;

struct SocketTask {
    handle: FeedHandle,
    token: CancellationToken,
    task: JoinHandle<WsResult<()>>,
}

struct AggregatorTask {
    handle: AggregatorHandle,
    task: JoinHandle<()>,
}

/// Main application.
pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(?e, "Failed to listen for shutdown signal"),
            }
            signal_token.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run until `shutdown` is cancelled, then tear every component down.
    pub async fn run_until(self, shutdown: CancellationToken) -> AppResult<()> {
        let watcher = self.start_watcher()?;
        let (event_tx, mut event_rx) = mpsc::channel::<FeedEvent>(EVENT_BUFFER);

        let socket = if self.config.socket_active() {
            Some(self.start_socket(event_tx).await?)
        } else {
            drop(event_tx);
            None
        };
        let aggregator = if self.config.aggregator_active() {
            Some(self.start_aggregator().await?)
        } else {
            None
        };

        let mut phase_rx = socket.as_ref().map(|s| s.handle.phase_watch());
        let mut prices_rx = aggregator.as_ref().map(|a| a.handle.subscribe());
        let mut observation_rx = watcher.as_ref().map(LastPriceWatcher::subscribe);

        info!("Entering main event loop");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(event) = event_rx.recv() => log_event(event),

                Some(phase) = next_change(&mut phase_rx) => log_phase(phase),

                Some(prices) = next_change(&mut prices_rx) => log_prices(&prices),

                Some(observation) = next_change(&mut observation_rx) => log_observation(&observation),
            }
        }

        info!("Shutting down");
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        if let Some(aggregator) = aggregator {
            if let Err(e) = aggregator.handle.shutdown().await {
                warn!(?e, "Aggregator already stopped");
            }
            if let Err(e) = aggregator.task.await {
                error!(?e, "Aggregator task panicked");
            }
        }
        if let Some(socket) = socket {
            if let Err(e) = socket.handle.disconnect().await {
                warn!(?e, "Socket already stopped");
            }
            socket.token.cancel();
            match socket.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(?e, "Socket task ended with error"),
                Err(e) => error!(?e, "Socket task panicked"),
            }
        }
        info!("Shutdown complete");
        Ok(())
    }

    async fn start_socket(&self, event_tx: mpsc::Sender<FeedEvent>) -> AppResult<SocketTask> {
        let socket = &self.config.socket;
        info!(url = %socket.url, symbols = ?socket.symbols, "Starting socket feed");

        let manager = ConnectionManager::new(socket.clone().into(), event_tx);
        let handle = manager.handle();
        let token = manager.shutdown_token();
        let task = tokio::spawn(manager.run());

        handle.set_subscriptions(&socket.symbols).await?;
        handle.connect().await?;

        Ok(SocketTask { handle, token, task })
    }

    async fn start_aggregator(&self) -> AppResult<AggregatorTask> {
        let section = &self.config.aggregator;
        let origin = &self.config.api_origin;
        info!(%origin, symbols = ?section.symbols, "Starting price aggregator");

        let streams = Arc::new(SseStreamSource::new(origin.as_str(), section.stream_path.as_str())?);
        let prices: Arc<dyn LastPriceSource> =
            Arc::new(LastPriceClient::new(origin, &section.last_price_path)?);

        let (handle, task) = PriceAggregator::new(section.aggregator_config(), streams, prices).spawn();
        handle.set_symbols(&section.symbols).await?;

        Ok(AggregatorTask { handle, task })
    }

    fn start_watcher(&self) -> AppResult<Option<LastPriceWatcher>> {
        let Some(raw) = self.config.watcher.symbol.as_deref() else {
            return Ok(None);
        };
        let symbol = Symbol::parse(raw)?;
        info!(%symbol, "Starting last-price watcher");

        let source = Arc::new(LastPriceClient::new(&self.config.api_origin, &self.config.aggregator.last_price_path)?);
        Ok(Some(LastPriceWatcher::spawn(symbol, source, self.config.watch_interval())))
    }
}

/// Next value of an optional watch receiver; `None` once it is closed or absent.
async fn next_change<T: Clone>(rx: &mut Option<watch::Receiver<T>>) -> Option<T> {
    let rx = rx.as_mut()?;
    rx.changed().await.ok()?;
    let value = rx.borrow_and_update().clone();
    Some(value)
}

fn log_event(event: FeedEvent) {
    match event {
        FeedEvent::Trade(tick) => info!(symbol = %tick.symbol, price = tick.price, "Trade"),
        FeedEvent::Authenticated => info!("Socket authenticated"),
        FeedEvent::Status(status) => {
            debug!(status = ?status.status, message = ?status.message, "Socket status")
        }
        FeedEvent::Error(FeedFault::Transport(e)) => warn!(error = %e, "Socket transport error"),
        FeedEvent::Error(FeedFault::Rejected(status)) => {
            warn!(message = ?status.message, "Socket error status")
        }
    }
}

fn log_phase(phase: ConnectionPhase) {
    info!(%phase, "Socket phase changed");
}

fn log_prices(prices: &PriceMap) {
    info!(?prices, "Aggregated prices");
}

fn log_observation(observation: &PriceObservation) {
    info!(
        price = ?observation.price,
        timestamp = ?observation.timestamp,
        status = ?observation.status,
        error = ?observation.error,
        "Watched price"
    );
}
