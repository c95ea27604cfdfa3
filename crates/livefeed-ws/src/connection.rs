//! WebSocket connection manager.
//!
//! Drives a [`FeedSession`] over tokio-tungstenite: executes its actions,
//! feeds transport events back into it, and runs backoff timers. The
//! transport is owned exclusively by the task running [`ConnectionManager::run`].

use crate::backoff::Backoff;
use crate::error::{WsError, WsResult};
use crate::message::FeedEvent;
use crate::session::{ConnectionPhase, FeedSession, SessionAction, SessionConfig, ABNORMAL_CLOSE};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use livefeed_telemetry::Metrics;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type OpenFuture = Pin<Box<dyn Future<Output = WsResult<WsStream>> + Send>>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Feed API key sent in the handshake.
    pub api_key: String,
    /// Subscription channel prefix.
    pub channel_prefix: String,
    /// `ev` tag of trade ticks.
    pub trade_event: String,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "wss://socket.polygon.io/crypto".to_string(),
            api_key: String::new(),
            channel_prefix: "XT".to_string(),
            trade_event: "XT".to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30000,
            command_buffer: 100,
        }
    }
}

impl ConnectionConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            api_key: self.api_key.clone(),
            channel_prefix: self.channel_prefix.clone(),
            trade_event: self.trade_event.clone(),
            backoff: Backoff::new(self.reconnect_base_delay_ms, self.reconnect_max_delay_ms),
        }
    }
}

/// Request to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Connect,
    Disconnect,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    SetSubscriptions(Vec<String>),
}

/// Cloneable handle for controlling a running [`ConnectionManager`].
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<FeedCommand>,
    phase: watch::Receiver<ConnectionPhase>,
}

impl FeedHandle {
    pub async fn connect(&self) -> WsResult<()> {
        self.send(FeedCommand::Connect).await
    }

    pub async fn disconnect(&self) -> WsResult<()> {
        self.send(FeedCommand::Disconnect).await
    }

    pub async fn subscribe<I, S>(&self, symbols: I) -> WsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(FeedCommand::Subscribe(collect(symbols))).await
    }

    pub async fn unsubscribe<I, S>(&self, symbols: I) -> WsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(FeedCommand::Unsubscribe(collect(symbols))).await
    }

    pub async fn set_subscriptions<I, S>(&self, symbols: I) -> WsResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(FeedCommand::SetSubscriptions(collect(symbols))).await
    }

    /// Current connection phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn phase_watch(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    async fn send(&self, command: FeedCommand) -> WsResult<()> {
        self.tx.send(command).await.map_err(|_| WsError::ChannelClosed)
    }
}

fn collect<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    symbols.into_iter().map(Into::into).collect()
}

/// Open transport halves.
struct Transport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

/// Pending backoff timer.
struct ReconnectTimer {
    generation: u64,
    sleep: Pin<Box<Sleep>>,
}

/// WebSocket connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    session: FeedSession,
    event_tx: mpsc::Sender<FeedEvent>,
    command_tx: mpsc::Sender<FeedCommand>,
    command_rx: mpsc::Receiver<FeedCommand>,
    phase_tx: watch::Sender<ConnectionPhase>,
    phase_rx: watch::Receiver<ConnectionPhase>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    /// Create a new connection manager delivering events to `event_tx`.
    ///
    /// Trade ticks are offered with `try_send`: when `event_tx` is full the
    /// tick is dropped and counted under
    /// `livefeed_frames_dropped_total{reason="consumer_full"}`, so a slow
    /// consumer never stalls the socket. Status, authentication and error
    /// events wait for capacity.
    pub fn new(config: ConnectionConfig, event_tx: mpsc::Sender<FeedEvent>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Idle);
        let session = FeedSession::new(config.session_config());
        Self {
            config,
            session,
            event_tx,
            command_tx,
            command_rx,
            phase_tx,
            phase_rx,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle for sending commands.
    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            tx: self.command_tx.clone(),
            phase: self.phase_rx.clone(),
        }
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Signal graceful shutdown.
    pub fn shutdown(&self) {
        info!("ConnectionManager shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Run the connection task until shutdown.
    ///
    /// Nothing is opened until a `Connect` command arrives.
    pub async fn run(mut self) -> WsResult<()> {
        let mut transport: Option<Transport> = None;
        let mut opening: Option<OpenFuture> = None;
        let mut reconnect: Option<ReconnectTimer> = None;

        loop {
            let actions = tokio::select! {
                biased;

                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in connection loop");
                    let actions = self.session.disconnect();
                    self.execute(actions, &mut transport, &mut opening, &mut reconnect).await;
                    self.publish_phase();
                    return Ok(());
                }

                command = self.command_rx.recv() => match command {
                    Some(command) => self.apply_command(command),
                    None => {
                        // Unreachable while `self.command_tx` lives.
                        self.session.disconnect()
                    }
                },

                result = poll_open(&mut opening) => {
                    opening = None;
                    match result {
                        Ok(stream) => {
                            let (write, read) = stream.split();
                            transport = Some(Transport { write, read });
                            self.session.on_open()
                        }
                        Err(e) => {
                            error!(?e, "WebSocket connect failed");
                            let mut actions = self.session.on_error(e.to_string());
                            // No transport to close; the attempt itself is over.
                            actions.retain(|a| !matches!(a, SessionAction::CloseTransport { .. }));
                            actions.extend(self.session.on_close(ABNORMAL_CLOSE));
                            actions
                        }
                    }
                }

                msg = poll_read(&mut transport) => self.handle_frame(msg, &mut transport).await,

                generation = poll_timer(&mut reconnect) => {
                    reconnect = None;
                    self.session.on_reconnect_timer(generation)
                }
            };

            self.execute(actions, &mut transport, &mut opening, &mut reconnect)
                .await;
            self.publish_phase();
        }
    }

    fn apply_command(&mut self, command: FeedCommand) -> Vec<SessionAction> {
        debug!(?command, "Feed command");
        match command {
            FeedCommand::Connect => self.session.connect(),
            FeedCommand::Disconnect => self.session.disconnect(),
            FeedCommand::Subscribe(symbols) => self.session.subscribe(symbols),
            FeedCommand::Unsubscribe(symbols) => self.session.unsubscribe(symbols),
            FeedCommand::SetSubscriptions(symbols) => self.session.set_subscriptions(symbols),
        }
    }

    async fn handle_frame(
        &mut self,
        msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        transport: &mut Option<Transport>,
    ) -> Vec<SessionAction> {
        match msg {
            Some(Ok(Message::Text(text))) => self.session.on_text(&text),
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(t) = transport.as_mut() {
                    if let Err(e) = t.write.send(Message::Pong(data)).await {
                        return self.session.on_error(e.to_string());
                    }
                }
                Vec::new()
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (f.code.into(), f.reason.to_string()))
                    .unwrap_or((1005, "No status".to_string()));
                warn!(code, %reason, "WebSocket closed by server");
                *transport = None;
                self.session.on_close(code)
            }
            Some(Err(e)) => {
                error!(?e, "WebSocket read error");
                self.session.on_error(e.to_string())
            }
            None => {
                warn!("WebSocket stream ended");
                *transport = None;
                self.session.on_close(ABNORMAL_CLOSE)
            }
            Some(Ok(_)) => Vec::new(),
        }
    }

    /// Execute actions in order, feeding follow-up actions back in.
    async fn execute(
        &mut self,
        actions: Vec<SessionAction>,
        transport: &mut Option<Transport>,
        opening: &mut Option<OpenFuture>,
        reconnect: &mut Option<ReconnectTimer>,
    ) {
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::OpenTransport => {
                    *transport = None;
                    *opening = Some(self.open_future());
                }
                SessionAction::Send(msg) => {
                    let Some(t) = transport.as_mut() else {
                        warn!(?msg.action, "No open transport, dropping control message");
                        continue;
                    };
                    let result = match msg.to_json() {
                        Ok(text) => t
                            .write
                            .send(Message::Text(text))
                            .await
                            .map_err(WsError::from),
                        Err(e) => Err(WsError::from(e)),
                    };
                    match result {
                        Ok(()) => debug!(?msg.action, params = %msg.params, "Control message sent"),
                        Err(e) => queue.extend(self.session.on_error(e.to_string())),
                    }
                }
                SessionAction::CloseTransport { code } => {
                    *opening = None;
                    if let Some(mut t) = transport.take() {
                        if let Some(code) = code {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            };
                            if let Err(e) = t.write.send(Message::Close(Some(frame))).await {
                                debug!(?e, "Failed to send Close frame");
                            }
                        }
                    }
                    queue.extend(self.session.on_close(code.unwrap_or(ABNORMAL_CLOSE)));
                }
                SessionAction::ScheduleReconnect { delay, generation } => {
                    *reconnect = Some(ReconnectTimer {
                        generation,
                        sleep: Box::pin(tokio::time::sleep(delay)),
                    });
                }
                SessionAction::Emit(event) => self.emit(event).await,
            }
        }
    }

    async fn emit(&self, event: FeedEvent) {
        if let FeedEvent::Trade(tick) = &event {
            let symbol = tick.symbol.clone();
            match self.event_tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(%symbol, "Event consumer full, dropping tick");
                    Metrics::frame_dropped("consumer_full");
                }
                Err(TrySendError::Closed(_)) => warn!("Event receiver dropped"),
            }
        } else if self.event_tx.send(event).await.is_err() {
            warn!("Event receiver dropped");
        }
    }

    fn open_future(&self) -> OpenFuture {
        let url = self.config.url.clone();
        info!(url = %url, "Connecting to WebSocket");
        Box::pin(async move {
            let (stream, _response) = connect_async_tls_with_config(url, None, true, None)
                .await
                .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
            Ok(stream)
        })
    }

    fn publish_phase(&self) {
        let phase = self.session.phase();
        let changed = self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
        if changed {
            Metrics::ws_phase_set(phase.as_str());
        }
    }
}

async fn poll_open(opening: &mut Option<OpenFuture>) -> WsResult<WsStream> {
    match opening {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn poll_read(
    transport: &mut Option<Transport>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match transport {
        Some(t) => t.read.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_timer(reconnect: &mut Option<ReconnectTimer>) -> u64 {
    match reconnect {
        Some(timer) => {
            timer.sleep.as_mut().await;
            timer.generation
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livefeed_core::PriceTick;
    use livefeed_telemetry::metrics::FRAMES_DROPPED_TOTAL;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.reconnect_base_delay_ms, 1000);
        assert_eq!(config.reconnect_max_delay_ms, 30000);
        assert_eq!(config.channel_prefix, "XT");
    }

    #[test]
    fn test_session_config_backoff() {
        let config = ConnectionConfig {
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 200,
            ..Default::default()
        };
        let backoff = config.session_config().backoff;
        assert_eq!(backoff.delay(0).as_millis(), 50);
        assert_eq!(backoff.delay(5).as_millis(), 200);
    }

    fn tick(symbol: &str, price: f64) -> FeedEvent {
        let symbol = livefeed_core::Symbol::parse(symbol).unwrap();
        FeedEvent::Trade(PriceTick::new(symbol, price, serde_json::json!({ "p": price })).unwrap())
    }

    #[tokio::test]
    async fn test_handle_reports_idle_and_queues_commands() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(ConnectionConfig::default(), event_tx);
        let handle = manager.handle();
        assert_eq!(handle.phase(), ConnectionPhase::Idle);
        assert_ok!(handle.subscribe(["X:BTCUSD"]).await);
    }

    #[tokio::test]
    async fn test_handle_fails_after_manager_dropped() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(ConnectionConfig::default(), event_tx);
        let handle = manager.handle();
        drop(manager);
        let err = assert_err!(handle.connect().await);
        assert!(matches!(err, WsError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_full_consumer_drops_ticks_without_blocking() {
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let manager = ConnectionManager::new(ConnectionConfig::default(), event_tx);
        let dropped = FRAMES_DROPPED_TOTAL.with_label_values(&["consumer_full"]).get();

        manager.emit(tick("X:BTCUSD", 1.0)).await;
        let second = tokio::time::timeout(Duration::from_secs(1), manager.emit(tick("X:BTCUSD", 2.0))).await;
        assert!(second.is_ok(), "emitting into a full channel blocked");
        assert!(FRAMES_DROPPED_TOTAL.with_label_values(&["consumer_full"]).get() >= dropped + 1.0);

        assert_eq!(event_rx.recv().await, Some(tick("X:BTCUSD", 1.0)));
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_events_wait_for_capacity() {
        let (event_tx, mut event_rx) = mpsc::channel(1);
        let manager = ConnectionManager::new(ConnectionConfig::default(), event_tx);

        manager.emit(tick("X:ETHUSD", 3000.0)).await;
        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let first = event_rx.recv().await;
            let second = event_rx.recv().await;
            (first, second)
        });
        manager.emit(FeedEvent::Authenticated).await;

        let (first, second) = consumer.await.unwrap();
        assert_eq!(first, Some(tick("X:ETHUSD", 3000.0)));
        assert_eq!(second, Some(FeedEvent::Authenticated));
    }

    #[tokio::test]
    async fn test_emit_to_dropped_receiver_returns() {
        let (event_tx, event_rx) = mpsc::channel(1);
        let manager = ConnectionManager::new(ConnectionConfig::default(), event_tx);
        drop(event_rx);
        manager.emit(tick("X:BTCUSD", 1.0)).await;
        manager.emit(FeedEvent::Authenticated).await;
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(ConnectionConfig::default(), event_tx);
        let token = manager.shutdown_token();
        let task = tokio::spawn(manager.run());
        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
