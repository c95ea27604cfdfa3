//! Feed wire messages and inbound frame routing.

use livefeed_core::{is_positive_price, PriceTick, Symbol};
use livefeed_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// ============================================================================
// Control messages (Outgoing)
// ============================================================================

/// Control action understood by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Auth,
    Subscribe,
    Unsubscribe,
}

/// Outbound control message: `{"action": ..., "params": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub params: String,
}

impl ControlMessage {
    /// Credential handshake.
    pub fn auth(api_key: &str) -> Self {
        Self {
            action: ControlAction::Auth,
            params: api_key.to_string(),
        }
    }

    /// Subscribe to `{prefix}.{symbol}` for every symbol, comma-joined.
    pub fn subscribe<'a, I>(prefix: &str, symbols: I) -> Self
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        Self {
            action: ControlAction::Subscribe,
            params: join_channels(prefix, symbols),
        }
    }

    /// Unsubscribe from `{prefix}.{symbol}` for every symbol, comma-joined.
    pub fn unsubscribe<'a, I>(prefix: &str, symbols: I) -> Self
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        Self {
            action: ControlAction::Unsubscribe,
            params: join_channels(prefix, symbols),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn join_channels<'a, I>(prefix: &str, symbols: I) -> String
where
    I: IntoIterator<Item = &'a Symbol>,
{
    symbols
        .into_iter()
        .map(|s| s.channel(prefix))
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Status / info frame (anything carrying `status` or `message`).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFrame {
    pub status: Option<String>,
    pub message: Option<String>,
    pub raw: Value,
}

impl StatusFrame {
    /// `status == "success" && message == "authenticated"`.
    pub fn is_auth_success(&self) -> bool {
        self.status.as_deref() == Some("success") && self.message.as_deref() == Some("authenticated")
    }

    /// `status == "error" || message == "error"`.
    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error") || self.message.as_deref() == Some("error")
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Status(StatusFrame),
    Trade(PriceTick),
}

/// Error reported on the event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFault {
    /// Socket-level failure; the connection is closed and retried.
    Transport(String),
    /// Error status frame from the feed; the connection stays open.
    Rejected(StatusFrame),
}

/// Event delivered to the consumer of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Every status frame, for diagnostics.
    Status(StatusFrame),
    /// Handshake acknowledged; subscriptions are now live.
    Authenticated,
    Error(FeedFault),
    Trade(PriceTick),
}

/// Decodes and classifies inbound text frames.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    trade_event: String,
}

impl MessageRouter {
    /// `trade_event` is the `ev` tag identifying trade ticks (e.g. "XT").
    pub fn new(trade_event: impl Into<String>) -> Self {
        Self {
            trade_event: trade_event.into(),
        }
    }

    /// Classify every message of a frame, preserving batch order.
    ///
    /// Malformed JSON yields no messages.
    pub fn route(&self, text: &str) -> Vec<Inbound> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Dropping malformed frame");
                Metrics::frame_dropped("malformed");
                return Vec::new();
            }
        };

        let batch = match value {
            Value::Array(items) => items,
            other => vec![other],
        };

        batch
            .into_iter()
            .filter_map(|msg| self.classify(msg))
            .collect()
    }

    fn classify(&self, msg: Value) -> Option<Inbound> {
        let obj = msg.as_object()?;

        if obj.contains_key("status") || obj.contains_key("message") {
            let status = obj.get("status").and_then(Value::as_str).map(str::to_string);
            let message = obj.get("message").and_then(Value::as_str).map(str::to_string);
            return Some(Inbound::Status(StatusFrame {
                status,
                message,
                raw: msg,
            }));
        }

        if obj.get("ev").and_then(Value::as_str) != Some(self.trade_event.as_str()) {
            return None;
        }
        let price = obj.get("p").and_then(Value::as_f64)?;
        if !is_positive_price(price) {
            Metrics::frame_dropped("invalid_price");
            return None;
        }
        let symbol = obj
            .get("pair")
            .and_then(Value::as_str)
            .and_then(|pair| Symbol::parse(pair).ok())?;

        PriceTick::new(symbol, price, msg).map(Inbound::Trade)
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new("XT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    #[test]
    fn test_control_message_shapes() {
        let auth = ControlMessage::auth("key123").to_json().unwrap();
        assert_eq!(auth, r#"{"action":"auth","params":"key123"}"#);

        let symbols = [sym("X:BTCUSD"), sym("X:ETHUSD")];
        let sub = ControlMessage::subscribe("XT", symbols.iter());
        assert_eq!(sub.params, "XT.X:BTCUSD,XT.X:ETHUSD");
        assert_eq!(
            sub.to_json().unwrap(),
            r#"{"action":"subscribe","params":"XT.X:BTCUSD,XT.X:ETHUSD"}"#
        );

        let unsub = ControlMessage::unsubscribe("XT", [sym("X:SOLUSD")].iter());
        assert_eq!(unsub.action, ControlAction::Unsubscribe);
        assert_eq!(unsub.params, "XT.X:SOLUSD");
    }

    #[test]
    fn test_route_single_tick_trims_pair() {
        let router = MessageRouter::default();
        let out = router.route(r#"{"ev":"XT","p":65000.12,"pair":"X:BTCUSD "}"#);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Inbound::Trade(tick) => {
                assert_eq!(tick.symbol.as_str(), "X:BTCUSD");
                assert_eq!(tick.price, 65000.12);
                assert_eq!(tick.raw["pair"], json!("X:BTCUSD "));
            }
            other => panic!("Expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_route_batch_preserves_order() {
        let router = MessageRouter::default();
        let frame = json!([
            {"ev": "status", "status": "success", "message": "authenticated"},
            {"ev": "XT", "p": 1.5, "pair": "X:AAAUSD"},
            {"ev": "XT", "p": 2.5, "pair": "X:BBBUSD"},
        ])
        .to_string();

        let out = router.route(&frame);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Inbound::Status(s) if s.is_auth_success()));
        assert!(matches!(&out[1], Inbound::Trade(t) if t.symbol.as_str() == "X:AAAUSD"));
        assert!(matches!(&out[2], Inbound::Trade(t) if t.symbol.as_str() == "X:BBBUSD"));
    }

    #[test]
    fn test_route_malformed_is_silent() {
        let router = MessageRouter::default();
        assert!(router.route("{not json").is_empty());
        assert!(router.route("").is_empty());
    }

    #[test]
    fn test_route_rejects_invalid_ticks() {
        let router = MessageRouter::default();
        let frame = json!([
            {"ev": "XT", "p": 0, "pair": "X:BTCUSD"},
            {"ev": "XT", "p": -3.0, "pair": "X:BTCUSD"},
            {"ev": "XT", "p": "100", "pair": "X:BTCUSD"},
            {"ev": "XT", "p": 100.0, "pair": 42},
            {"ev": "XT", "p": 100.0, "pair": "   "},
            {"ev": "XQ", "p": 100.0, "pair": "X:BTCUSD"},
            7,
        ])
        .to_string();
        assert!(router.route(&frame).is_empty());
    }

    #[test]
    fn test_status_frame_markers() {
        let router = MessageRouter::default();
        let out = router.route(r#"[{"status":"error","message":"bad key"},{"status":"connected","message":"Connected Successfully"}]"#);
        assert_eq!(out.len(), 2);
        match (&out[0], &out[1]) {
            (Inbound::Status(err), Inbound::Status(info)) => {
                assert!(err.is_error());
                assert!(!err.is_auth_success());
                assert!(!info.is_error());
                assert!(!info.is_auth_success());
            }
            other => panic!("Expected two status frames, got {other:?}"),
        }
    }

    #[test]
    fn test_status_takes_precedence_over_tick() {
        let router = MessageRouter::default();
        let out = router.route(r#"{"ev":"XT","p":10.0,"pair":"X:BTCUSD","message":"hi"}"#);
        assert!(matches!(&out[0], Inbound::Status(_)));
    }
}
