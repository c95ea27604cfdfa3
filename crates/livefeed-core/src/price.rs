//! Price validity rules and trade ticks.

use crate::symbol::Symbol;
use serde::Serialize;

/// Minimum price magnitude treated as a real observation.
///
/// Values at or below this are noise and never reach consumers.
pub const NOISE_FLOOR: f64 = 0.01;

/// Trade tick gate used by the socket router: finite and strictly positive.
#[inline]
pub fn is_positive_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// Observation gate used by price maps: finite and above [`NOISE_FLOOR`].
#[inline]
pub fn is_observable_price(price: f64) -> bool {
    price.is_finite() && price > NOISE_FLOOR
}

/// A single trade observation from the socket feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceTick {
    /// Trimmed pair symbol.
    pub symbol: Symbol,
    /// Trade price.
    pub price: f64,
    /// Original decoded message.
    pub raw: serde_json::Value,
}

impl PriceTick {
    /// Build a tick, rejecting prices that are not finite and positive.
    pub fn new(symbol: Symbol, price: f64, raw: serde_json::Value) -> Option<Self> {
        is_positive_price(price).then(|| Self { symbol, price, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_positive_price_gate() {
        assert!(!is_positive_price(-5.0));
        assert!(!is_positive_price(0.0));
        assert!(!is_positive_price(f64::NAN));
        assert!(!is_positive_price(f64::INFINITY));
        assert!(is_positive_price(0.005));
    }

    #[test]
    fn test_observable_price_gate() {
        let accepted: Vec<f64> = [-5.0, 0.0, 0.005, 0.01, 0.011, 100.0]
            .into_iter()
            .filter(|p| is_observable_price(*p))
            .collect();
        assert_eq!(accepted, vec![0.011, 100.0]);
    }

    #[test]
    fn test_tick_rejects_non_positive() {
        let sym = Symbol::parse("X:BTCUSD").unwrap();
        assert!(PriceTick::new(sym.clone(), 0.0, json!({})).is_none());
        let tick = PriceTick::new(sym, 65000.12, json!({"p": 65000.12})).unwrap();
        assert_eq!(tick.price, 65000.12);
    }
}
