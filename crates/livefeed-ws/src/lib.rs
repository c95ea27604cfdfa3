//! WebSocket client for the crypto trade feed.
//!
//! Provides a single shared connection for many symbols with:
//! - Credential handshake gating all subscription traffic
//! - Desired-set subscription reconciliation (diff-based subscribe/unsubscribe)
//! - Full resubscribe after every (re)authentication
//! - Automatic reconnection with capped exponential backoff
//! - Channel-based delivery of status, error and trade events
//!
//! The protocol logic lives in [`FeedSession`], a sans-IO state machine;
//! [`ConnectionManager`] drives it over tokio-tungstenite.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod message;
pub mod session;
pub mod subscription;

pub use backoff::Backoff;
pub use connection::{ConnectionConfig, ConnectionManager, FeedCommand, FeedHandle};
pub use error::{WsError, WsResult};
pub use message::{
    ControlAction, ControlMessage, FeedEvent, FeedFault, Inbound, MessageRouter, StatusFrame,
};
pub use session::{ConnectionPhase, FeedSession, SessionAction, SessionConfig};
pub use subscription::{SubscriptionDiff, SubscriptionSet};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
