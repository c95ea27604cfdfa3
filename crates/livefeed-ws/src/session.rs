//! Feed session state machine.
//!
//! `FeedSession` holds all protocol state of one logical connection and
//! performs no IO. Transport events and caller requests go in, a list of
//! [`SessionAction`]s comes out, and the driver executes them in order.
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Subscribed
//!            ^               |                |
//!            |             close            close
//!            |               v                v
//!            +----------- Backoff <-----------+
//! ```
//!
//! `disconnect()` moves any live phase to `Closing` and then `Idle`.

use crate::backoff::Backoff;
use crate::message::{ControlMessage, FeedEvent, FeedFault, Inbound, MessageRouter, StatusFrame};
use crate::subscription::SubscriptionSet;
use livefeed_core::Symbol;
use livefeed_telemetry::Metrics;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Normal closure code used by `disconnect()`.
pub const NORMAL_CLOSE: u16 = 1000;
/// Abnormal closure code (no close frame received).
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Observable phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Authenticating,
    Subscribed,
    Closing,
    Backoff,
}

impl ConnectionPhase {
    /// A transport exists, open or pending open.
    pub fn has_transport(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating | Self::Subscribed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
            Self::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Open a new transport; report `on_open` or `on_error` + `on_close`.
    OpenTransport,
    /// Write a control message to the open transport.
    Send(ControlMessage),
    /// Close the transport (`None` = force close without a close frame),
    /// then report `on_close`.
    CloseTransport { code: Option<u16> },
    /// Call `on_reconnect_timer(generation)` after `delay`.
    ScheduleReconnect { delay: Duration, generation: u64 },
    /// Deliver an event to the consumer.
    Emit(FeedEvent),
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Credential sent in the handshake.
    pub api_key: String,
    /// Channel prefix for subscriptions (e.g. "XT").
    pub channel_prefix: String,
    /// `ev` tag of trade ticks.
    pub trade_event: String,
    pub backoff: Backoff,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            channel_prefix: "XT".to_string(),
            trade_event: "XT".to_string(),
            backoff: Backoff::default(),
        }
    }
}

/// Protocol state of a single feed connection.
#[derive(Debug)]
pub struct FeedSession {
    config: SessionConfig,
    router: MessageRouter,
    phase: ConnectionPhase,
    connected: bool,
    authenticated: bool,
    desired_open: bool,
    retry_count: u32,
    /// Bumped on every schedule/cancel so stale timers are ignored.
    generation: u64,
    subscriptions: SubscriptionSet,
}

impl FeedSession {
    pub fn new(config: SessionConfig) -> Self {
        let router = MessageRouter::new(config.trade_event.clone());
        Self {
            config,
            router,
            phase: ConnectionPhase::Idle,
            connected: false,
            authenticated: false,
            desired_open: false,
            retry_count: 0,
            generation: 0,
            subscriptions: SubscriptionSet::new(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn desired_open(&self) -> bool {
        self.desired_open
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Desired symbols in sorted order.
    pub fn subscriptions(&self) -> Vec<Symbol> {
        self.subscriptions.symbols()
    }

    // ------------------------------------------------------------------
    // Caller requests
    // ------------------------------------------------------------------

    /// Open the connection unless one is already open or opening.
    pub fn connect(&mut self) -> Vec<SessionAction> {
        if self.phase.has_transport() {
            debug!(phase = %self.phase, "connect() ignored, transport exists");
            return Vec::new();
        }
        self.desired_open = true;
        // A pending backoff timer is superseded by this open.
        self.generation += 1;
        self.open()
    }

    /// Close permanently; no reconnect follows.
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        self.desired_open = false;
        self.generation += 1;

        if self.phase.has_transport() {
            info!("Disconnect requested, closing transport");
            self.phase = ConnectionPhase::Closing;
            self.connected = false;
            self.authenticated = false;
            vec![SessionAction::CloseTransport {
                code: Some(NORMAL_CLOSE),
            }]
        } else {
            self.phase = ConnectionPhase::Idle;
            Vec::new()
        }
    }

    /// Add symbols; sends a subscribe for the new ones only when authenticated.
    pub fn subscribe<I, S>(&mut self, symbols: I) -> Vec<SessionAction>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added = self.subscriptions.insert_all(symbols);
        if added.is_empty() || !self.is_live() {
            return Vec::new();
        }
        debug!(count = added.len(), "Subscribing to new symbols");
        vec![SessionAction::Send(ControlMessage::subscribe(
            &self.config.channel_prefix,
            added.iter(),
        ))]
    }

    /// Remove symbols; sends an unsubscribe for the removed ones only when authenticated.
    pub fn unsubscribe<I, S>(&mut self, symbols: I) -> Vec<SessionAction>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = self.subscriptions.remove_all(symbols);
        if removed.is_empty() || !self.is_live() {
            return Vec::new();
        }
        debug!(count = removed.len(), "Unsubscribing from symbols");
        vec![SessionAction::Send(ControlMessage::unsubscribe(
            &self.config.channel_prefix,
            removed.iter(),
        ))]
    }

    /// Converge the desired set to `symbols`.
    pub fn set_subscriptions<I, S>(&mut self, symbols: I) -> Vec<SessionAction>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let diff = self.subscriptions.diff(symbols);
        let mut actions = self.subscribe(diff.to_add.iter().map(Symbol::as_str));
        actions.extend(self.unsubscribe(diff.to_remove.iter().map(Symbol::as_str)));
        actions
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Transport opened: reset retry state and send the handshake.
    pub fn on_open(&mut self) -> Vec<SessionAction> {
        if self.phase != ConnectionPhase::Connecting {
            warn!(phase = %self.phase, "Unexpected open event");
        }
        self.connected = true;
        self.authenticated = false;
        self.retry_count = 0;
        self.phase = ConnectionPhase::Authenticating;
        Metrics::ws_connected();
        info!("Feed connected, sending handshake");

        vec![SessionAction::Send(ControlMessage::auth(&self.config.api_key))]
    }

    /// Transport closed, intentionally or not.
    pub fn on_close(&mut self, code: u16) -> Vec<SessionAction> {
        if matches!(self.phase, ConnectionPhase::Idle | ConnectionPhase::Backoff) {
            return Vec::new();
        }
        self.connected = false;
        self.authenticated = false;
        Metrics::ws_disconnected();

        if !self.desired_open {
            info!(code, "Feed closed");
            self.phase = ConnectionPhase::Idle;
            return Vec::new();
        }

        warn!(code, "Feed closed unexpectedly");
        vec![self.schedule_reconnect()]
    }

    /// Transport error: report it, then force-close.
    pub fn on_error(&mut self, error: impl Into<String>) -> Vec<SessionAction> {
        let error = error.into();
        warn!(%error, "Feed transport error");
        vec![
            SessionAction::Emit(FeedEvent::Error(FeedFault::Transport(error))),
            SessionAction::CloseTransport { code: None },
        ]
    }

    /// Backoff timer fired.
    pub fn on_reconnect_timer(&mut self, generation: u64) -> Vec<SessionAction> {
        if generation != self.generation
            || !self.desired_open
            || self.phase != ConnectionPhase::Backoff
        {
            debug!(generation, "Stale reconnect timer ignored");
            return Vec::new();
        }
        info!(attempt = self.retry_count, "Reconnecting");
        self.open()
    }

    /// Inbound text frame.
    pub fn on_text(&mut self, text: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        for inbound in self.router.route(text) {
            match inbound {
                Inbound::Status(frame) => self.handle_status(frame, &mut actions),
                Inbound::Trade(tick) => {
                    Metrics::tick_received(tick.symbol.as_str());
                    actions.push(SessionAction::Emit(FeedEvent::Trade(tick)));
                }
            }
        }
        actions
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn is_live(&self) -> bool {
        self.connected && self.authenticated
    }

    fn open(&mut self) -> Vec<SessionAction> {
        self.phase = ConnectionPhase::Connecting;
        self.connected = false;
        self.authenticated = false;
        vec![SessionAction::OpenTransport]
    }

    fn schedule_reconnect(&mut self) -> SessionAction {
        let delay = self.config.backoff.delay(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        self.generation += 1;
        self.phase = ConnectionPhase::Backoff;
        Metrics::ws_reconnect_scheduled();
        info!(
            attempt = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        SessionAction::ScheduleReconnect {
            delay,
            generation: self.generation,
        }
    }

    fn handle_status(&mut self, frame: StatusFrame, actions: &mut Vec<SessionAction>) {
        let auth_success = frame.is_auth_success();
        let is_error = frame.is_error();
        actions.push(SessionAction::Emit(FeedEvent::Status(frame.clone())));

        if auth_success {
            if !self.connected {
                debug!("Auth acknowledgment without open transport ignored");
                return;
            }
            self.authenticated = true;
            self.phase = ConnectionPhase::Subscribed;
            info!(symbols = self.subscriptions.len(), "Feed authenticated");
            actions.push(SessionAction::Emit(FeedEvent::Authenticated));

            if !self.subscriptions.is_empty() {
                actions.push(SessionAction::Send(ControlMessage::subscribe(
                    &self.config.channel_prefix,
                    self.subscriptions.iter(),
                )));
            }
        } else if is_error {
            warn!(status = ?frame.status, message = ?frame.message, "Feed reported error status");
            actions.push(SessionAction::Emit(FeedEvent::Error(FeedFault::Rejected(frame))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ControlAction;

    const AUTH_OK: &str = r#"[{"ev":"status","status":"success","message":"authenticated"}]"#;

    fn session() -> FeedSession {
        FeedSession::new(SessionConfig {
            api_key: "secret".to_string(),
            ..Default::default()
        })
    }

    /// Session that has opened and authenticated.
    fn live_session() -> FeedSession {
        let mut s = session();
        s.connect();
        s.on_open();
        s.on_text(AUTH_OK);
        assert!(s.is_authenticated());
        s
    }

    fn sends(actions: &[SessionAction]) -> Vec<&ControlMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn scheduled(actions: &[SessionAction]) -> Option<(Duration, u64)> {
        actions.iter().find_map(|a| match a {
            SessionAction::ScheduleReconnect { delay, generation } => Some((*delay, *generation)),
            _ => None,
        })
    }

    #[test]
    fn test_connect_opens_once() {
        let mut s = session();
        assert_eq!(s.connect(), vec![SessionAction::OpenTransport]);
        assert!(s.desired_open());
        assert_eq!(s.phase(), ConnectionPhase::Connecting);
        // Pending open: second connect is a no-op
        assert!(s.connect().is_empty());
        s.on_open();
        assert!(s.connect().is_empty());
    }

    #[test]
    fn test_open_sends_handshake() {
        let mut s = session();
        s.connect();
        let actions = s.on_open();
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].action, ControlAction::Auth);
        assert_eq!(msgs[0].params, "secret");
        assert!(s.is_connected());
        assert!(!s.is_authenticated());
        assert_eq!(s.phase(), ConnectionPhase::Authenticating);
    }

    #[test]
    fn test_no_subscribe_before_auth() {
        let mut s = session();
        s.connect();
        s.on_open();

        assert!(sends(&s.subscribe(["X:BTCUSD"])).is_empty());

        let actions = s.on_text(AUTH_OK);
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].action, ControlAction::Subscribe);
        assert_eq!(msgs[0].params, "XT.X:BTCUSD");
        assert!(actions.contains(&SessionAction::Emit(FeedEvent::Authenticated)));
        assert_eq!(s.phase(), ConnectionPhase::Subscribed);
    }

    #[test]
    fn test_subscribe_while_idle_is_buffered() {
        let mut s = session();
        assert!(s.subscribe(["X:ETHUSD", "X:BTCUSD"]).is_empty());
        s.connect();
        s.on_open();
        let actions = s.on_text(AUTH_OK);
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].params, "XT.X:BTCUSD,XT.X:ETHUSD");
    }

    #[test]
    fn test_auth_without_subscriptions_sends_nothing() {
        let mut s = session();
        s.connect();
        s.on_open();
        assert!(sends(&s.on_text(AUTH_OK)).is_empty());
    }

    #[test]
    fn test_auth_never_arrives() {
        let mut s = session();
        s.subscribe(["X:BTCUSD"]);
        s.connect();
        s.on_open();
        for frame in [
            r#"{"ev":"status","status":"connected","message":"Connected Successfully"}"#,
            r#"{"ev":"XT","p":100.0,"pair":"X:BTCUSD"}"#,
            "garbage",
        ] {
            assert!(sends(&s.on_text(frame)).is_empty());
        }
        assert!(!s.is_authenticated());
    }

    #[test]
    fn test_subscribe_only_new_when_live() {
        let mut s = live_session();
        let msgs_first = s.subscribe(["X:BTCUSD"]);
        assert_eq!(sends(&msgs_first)[0].params, "XT.X:BTCUSD");

        let actions = s.subscribe(["X:BTCUSD", "X:ETHUSD"]);
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].params, "XT.X:ETHUSD");

        assert!(s.subscribe(["X:ETHUSD"]).is_empty());
    }

    #[test]
    fn test_unsubscribe_only_removed_when_live() {
        let mut s = live_session();
        s.subscribe(["X:BTCUSD", "X:ETHUSD"]);
        let actions = s.unsubscribe(["X:ETHUSD", "X:DOGEUSD"]);
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].action, ControlAction::Unsubscribe);
        assert_eq!(msgs[0].params, "XT.X:ETHUSD");
        assert!(s.unsubscribe(["X:ETHUSD"]).is_empty());
    }

    #[test]
    fn test_set_subscriptions_idempotent() {
        let mut s = live_session();
        let first = s.set_subscriptions(["X:BTCUSD", "X:ETHUSD"]);
        assert_eq!(sends(&first).len(), 1);
        assert!(s.set_subscriptions(["X:BTCUSD", "X:ETHUSD"]).is_empty());
    }

    #[test]
    fn test_set_subscriptions_diff() {
        let mut s = live_session();
        s.set_subscriptions(["A", "B", "C"]);
        let actions = s.set_subscriptions(["B", "C", "D"]);
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].action, ControlAction::Subscribe);
        assert_eq!(msgs[0].params, "XT.D");
        assert_eq!(msgs[1].action, ControlAction::Unsubscribe);
        assert_eq!(msgs[1].params, "XT.A");
        let desired: Vec<String> = s.subscriptions().iter().map(|s| s.to_string()).collect();
        assert_eq!(desired, vec!["B", "C", "D"]);
    }

    #[test]
    fn test_unexpected_close_schedules_first_backoff() {
        let mut s = live_session();
        let actions = s.on_close(ABNORMAL_CLOSE);
        assert_eq!(actions.len(), 1);
        let (delay, generation) = scheduled(&actions).unwrap();
        assert_eq!(delay, Duration::from_millis(1000));
        assert_eq!(s.phase(), ConnectionPhase::Backoff);
        assert!(!s.is_connected());
        assert!(!s.is_authenticated());
        assert_eq!(s.retry_count(), 1);

        assert_eq!(s.on_reconnect_timer(generation), vec![SessionAction::OpenTransport]);
        s.on_open();
        assert_eq!(s.retry_count(), 0);
    }

    #[test]
    fn test_consecutive_failures_back_off() {
        let mut s = session();
        s.connect();
        let mut delays = Vec::new();
        for _ in 0..7 {
            // Open attempt fails: error then close
            let actions = s.on_error("refused");
            assert!(actions.contains(&SessionAction::CloseTransport { code: None }));
            let (delay, generation) = scheduled(&s.on_close(ABNORMAL_CLOSE)).unwrap();
            delays.push(delay.as_millis());
            assert_eq!(s.on_reconnect_timer(generation), vec![SessionAction::OpenTransport]);
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_disconnect_during_backoff_suppresses_reconnect() {
        let mut s = live_session();
        let (_, generation) = scheduled(&s.on_close(ABNORMAL_CLOSE)).unwrap();

        assert!(s.disconnect().is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Idle);
        assert!(s.on_reconnect_timer(generation).is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Idle);
    }

    #[test]
    fn test_disconnect_closes_normally_without_reconnect() {
        let mut s = live_session();
        assert_eq!(
            s.disconnect(),
            vec![SessionAction::CloseTransport {
                code: Some(NORMAL_CLOSE)
            }]
        );
        assert_eq!(s.phase(), ConnectionPhase::Closing);
        assert!(s.on_close(NORMAL_CLOSE).is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Idle);
    }

    #[test]
    fn test_reconnect_resubscribes_full_set() {
        let mut s = live_session();
        s.subscribe(["X:BTCUSD", "X:SOLUSD"]);
        let (_, generation) = scheduled(&s.on_close(ABNORMAL_CLOSE)).unwrap();

        // Changes while down stay local
        assert!(s.unsubscribe(["X:SOLUSD"]).is_empty());
        assert!(s.subscribe(["X:ETHUSD"]).is_empty());

        s.on_reconnect_timer(generation);
        s.on_open();
        let actions = s.on_text(AUTH_OK);
        let msgs = sends(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].params, "XT.X:BTCUSD,XT.X:ETHUSD");
    }

    #[test]
    fn test_connect_during_backoff_supersedes_timer() {
        let mut s = live_session();
        let (_, generation) = scheduled(&s.on_close(ABNORMAL_CLOSE)).unwrap();
        assert_eq!(s.connect(), vec![SessionAction::OpenTransport]);
        assert!(s.on_reconnect_timer(generation).is_empty());
    }

    #[test]
    fn test_error_status_is_forwarded_not_fatal() {
        let mut s = session();
        s.connect();
        s.on_open();
        let actions = s.on_text(r#"{"ev":"status","status":"error","message":"not authorized"}"#);
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::Emit(FeedEvent::Error(FeedFault::Rejected(_))))));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SessionAction::CloseTransport { .. })));
        assert!(s.is_connected());
    }

    #[test]
    fn test_trade_tick_emitted_trimmed() {
        let mut s = live_session();
        let actions = s.on_text(r#"{"ev":"XT","p":65000.12,"pair":"X:BTCUSD "}"#);
        match actions.as_slice() {
            [SessionAction::Emit(FeedEvent::Trade(tick))] => {
                assert_eq!(tick.symbol.as_str(), "X:BTCUSD");
                assert_eq!(tick.price, 65000.12);
            }
            other => panic!("Expected one trade event, got {other:?}"),
        }
    }

    #[test]
    fn test_close_when_idle_ignored() {
        let mut s = session();
        assert!(s.on_close(ABNORMAL_CLOSE).is_empty());
        assert_eq!(s.phase(), ConnectionPhase::Idle);
    }
}
