//! Price feeds for the livefeed client.
//!
//! Per-symbol prices arrive either over a server-push stream or, when the
//! stream cannot be opened or fails at runtime, from a REST poller hitting
//! the last-known-price endpoint. `PriceAggregator` reconciles a dynamic
//! symbol list against those feeds and publishes a `PriceBook`.

pub mod aggregator;
pub mod error;
pub mod poller;
pub mod price_book;
pub mod rest;
pub mod stream;
pub mod watcher;

pub use aggregator::{
    AggregatorConfig, AggregatorHandle, FeedKind, PriceAggregator, StreamFailure,
    DEFAULT_POLL_INTERVAL,
};
pub use error::{FeedError, FeedResult};
pub use poller::{spawn_poller, PollHandle, PollSink};
pub use price_book::{PriceBook, PriceMap};
pub use rest::{LastPrice, LastPriceClient, LastPriceSource};
pub use stream::{PriceStream, PriceStreamSource, SseStreamSource, StreamUpdate};
pub use watcher::{
    LastPriceWatcher, ObservationStatus, PriceObservation, DEFAULT_WATCH_INTERVAL,
};
