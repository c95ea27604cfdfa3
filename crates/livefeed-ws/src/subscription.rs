//! Desired-subscription tracking.
//!
//! The desired set is the single source of truth for what should be
//! subscribed. The feed does not persist subscriptions across reconnects,
//! so the session replays the whole set after every authentication.

use livefeed_core::Symbol;
use std::collections::BTreeSet;

/// Set difference between the current desired set and a target set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub to_add: Vec<Symbol>,
    pub to_remove: Vec<Symbol>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Desired symbol set.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    desired: BTreeSet<Symbol>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add symbols, returning only those not already present.
    pub fn insert_all<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        parse_symbols(symbols)
            .into_iter()
            .filter(|s| self.desired.insert(s.clone()))
            .collect()
    }

    /// Remove symbols, returning only those that were present.
    pub fn remove_all<I, S>(&mut self, symbols: I) -> Vec<Symbol>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        parse_symbols(symbols)
            .into_iter()
            .filter(|s| self.desired.remove(s))
            .collect()
    }

    /// Compute `next - current` and `current - next`.
    pub fn diff<I, S>(&self, next: I) -> SubscriptionDiff
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next: BTreeSet<Symbol> = parse_symbols(next).into_iter().collect();
        SubscriptionDiff {
            to_add: next.difference(&self.desired).cloned().collect(),
            to_remove: self.desired.difference(&next).cloned().collect(),
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.desired.contains(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.desired.iter()
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }

    /// Snapshot of the desired symbols in sorted order.
    pub fn symbols(&self) -> Vec<Symbol> {
        self.desired.iter().cloned().collect()
    }
}

/// Trim and drop blank entries, keeping first occurrence order.
fn parse_symbols<I, S>(symbols: I) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    symbols
        .into_iter()
        .filter_map(|s| Symbol::parse(s.as_ref()).ok())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(symbols: &[Symbol]) -> Vec<&str> {
        symbols.iter().map(Symbol::as_str).collect()
    }

    #[test]
    fn test_insert_returns_only_new() {
        let mut set = SubscriptionSet::new();
        assert_eq!(names(&set.insert_all(["X:BTCUSD", " X:ETHUSD"])), vec!["X:BTCUSD", "X:ETHUSD"]);
        assert_eq!(names(&set.insert_all(["X:BTCUSD", "X:SOLUSD"])), vec!["X:SOLUSD"]);
        assert_eq!(set.len(), 3);
        assert!(set.contains("X:ETHUSD"));
    }

    #[test]
    fn test_insert_ignores_blank_and_duplicates() {
        let mut set = SubscriptionSet::new();
        let added = set.insert_all(["", "  ", "X:BTCUSD", "X:BTCUSD "]);
        assert_eq!(names(&added), vec!["X:BTCUSD"]);
    }

    #[test]
    fn test_remove_returns_only_present() {
        let mut set = SubscriptionSet::new();
        set.insert_all(["X:BTCUSD", "X:ETHUSD"]);
        let removed = set.remove_all(["X:ETHUSD", "X:DOGEUSD"]);
        assert_eq!(names(&removed), vec!["X:ETHUSD"]);
        assert_eq!(names(&set.symbols()), vec!["X:BTCUSD"]);
    }

    #[test]
    fn test_diff_abc_to_bcd() {
        let mut set = SubscriptionSet::new();
        set.insert_all(["A", "B", "C"]);
        let diff = set.diff(["B", "C", "D"]);
        assert_eq!(names(&diff.to_add), vec!["D"]);
        assert_eq!(names(&diff.to_remove), vec!["A"]);
    }

    #[test]
    fn test_diff_same_set_is_empty() {
        let mut set = SubscriptionSet::new();
        set.insert_all(["X:BTCUSD", "X:ETHUSD"]);
        assert!(set.diff([" X:ETHUSD", "X:BTCUSD"]).is_empty());
    }
}
