//! Shared symbol → last price map.
//!
//! Entries exist only for tracked symbols. A tracked symbol starts at
//! `None` and is only ever overwritten by an observable price that differs
//! from the stored one, so subscribers are woken on real changes only.

use livefeed_core::{is_observable_price, Symbol};
use livefeed_telemetry::Metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Immutable snapshot of the book.
pub type PriceMap = BTreeMap<String, Option<f64>>;

/// Watch-backed price map shared between feeds and consumers.
#[derive(Debug, Clone)]
pub struct PriceBook {
    tx: Arc<watch::Sender<PriceMap>>,
}

impl PriceBook {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PriceMap::new());
        Self { tx: Arc::new(tx) }
    }

    /// Add a `None` entry for every symbol not already tracked.
    pub fn track<'a, I>(&self, symbols: I)
    where
        I: IntoIterator<Item = &'a Symbol>,
    {
        let symbols: Vec<&Symbol> = symbols.into_iter().collect();
        self.tx.send_if_modified(|map| {
            let mut changed = false;
            for symbol in &symbols {
                if !map.contains_key(symbol.as_str()) {
                    map.insert(symbol.to_string(), None);
                    changed = true;
                }
            }
            changed
        });
    }

    /// Drop every entry whose key is not in `keep`.
    pub fn retain(&self, keep: &[Symbol]) {
        self.tx.send_if_modified(|map| {
            let before = map.len();
            map.retain(|key, _| keep.iter().any(|s| s.as_str() == key));
            map.len() != before
        });
    }

    /// Record a price for a tracked symbol.
    ///
    /// Returns `true` if the stored value changed. Prices at or below the
    /// noise floor, non-finite prices, untracked symbols and repeats of
    /// the stored value are ignored.
    pub fn update(&self, symbol: &Symbol, price: f64, source: &str) -> bool {
        if !is_observable_price(price) {
            trace!(%symbol, price, source, "Ignoring unobservable price");
            return false;
        }

        let changed = self.tx.send_if_modified(|map| match map.get_mut(symbol.as_str()) {
            Some(slot) if *slot != Some(price) => {
                *slot = Some(price);
                true
            }
            _ => false,
        });

        if changed {
            Metrics::price_updated(source);
            trace!(%symbol, price, source, "Price updated");
        }
        changed
    }

    /// Last price for `symbol`, if tracked and observed.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.tx.borrow().get(symbol).copied().flatten()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.tx.borrow().contains_key(symbol)
    }

    pub fn snapshot(&self) -> PriceMap {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change of the map.
    pub fn subscribe(&self) -> watch::Receiver<PriceMap> {
        self.tx.subscribe()
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
    }
}
