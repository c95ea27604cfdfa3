//! Market symbol identifiers.
//!
//! Symbols are opaque strings as the feed provider names them
//! (e.g. "X:BTCUSD"). The socket client only trims them; the aggregator
//! additionally uppercases and filters them to a recognised prefix.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

/// Prefix of crypto pair symbols accepted by the aggregator.
pub const DEFAULT_SYMBOL_PREFIX: &str = "X:";

/// Trimmed, non-empty market symbol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Parse a raw symbol, trimming surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::EmptySymbol);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Normalize for aggregation: trim, uppercase, and require `prefix`.
    ///
    /// Returns `None` for empty input or symbols outside the prefix.
    pub fn normalized(raw: &str, prefix: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() || !upper.starts_with(&prefix.to_uppercase()) {
            return None;
        }
        Some(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel name on the socket feed: `{prefix}.{symbol}`.
    pub fn channel(&self, prefix: &str) -> String {
        format!("{prefix}.{}", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Normalize a symbol list into a deduplicated, sorted vector.
///
/// Entries that are empty or lack `prefix` are dropped.
pub fn normalize_symbols<I, S>(symbols: I, prefix: &str) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    symbols
        .into_iter()
        .filter_map(|s| Symbol::normalized(s.as_ref(), prefix))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
