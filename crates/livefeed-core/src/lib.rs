//! Core domain types for the livefeed price client.
//!
//! This crate provides the fundamental types shared by the socket client
//! and the price aggregator:
//! - `Symbol`: trimmed / normalized market symbol (e.g. "X:BTCUSD")
//! - `PriceTick`: a validated trade observation
//! - Price validity rules (positive, finite, above the noise floor)

pub mod error;
pub mod price;
pub mod symbol;

pub use error::{CoreError, Result};
pub use price::{is_observable_price, is_positive_price, PriceTick, NOISE_FLOOR};
pub use symbol::{normalize_symbols, Symbol, DEFAULT_SYMBOL_PREFIX};
