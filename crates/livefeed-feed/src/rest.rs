//! Last-known-price REST client.

use crate::error::{FeedError, FeedResult};
use async_trait::async_trait;
use livefeed_core::Symbol;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Default timeout for last-price requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Last known price as reported by the REST endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastPrice {
    pub price: f64,
    /// Milliseconds since the Unix epoch, when the server provides one.
    pub timestamp: Option<i64>,
}

/// Source of last-known prices for a single symbol.
///
/// `Ok(None)` means the server has nothing for the symbol (no content);
/// callers keep whatever value they already have.
#[async_trait]
pub trait LastPriceSource: Send + Sync + 'static {
    async fn last_price(&self, symbol: &Symbol) -> FeedResult<Option<LastPrice>>;
}

/// reqwest-backed `LastPriceSource` for `GET {origin}{path}?symbol=SYM`.
pub struct LastPriceClient {
    client: Client,
    endpoint: Url,
}

impl LastPriceClient {
    /// Create a client for `{origin}{path}`.
    ///
    /// # Arguments
    /// * `origin` - API origin (e.g., "https://api.example.com")
    /// * `path` - Last-price endpoint path (e.g., "/api/prices/last")
    pub fn new(origin: &str, path: &str) -> FeedResult<Self> {
        let endpoint = Url::parse(&format!("{}{}", origin.trim_end_matches('/'), path))
            .map_err(|e| FeedError::InvalidUrl(format!("{origin}{path}: {e}")))?;

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| FeedError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fetch the last price for `symbol`.
    pub async fn fetch_last_price(&self, symbol: &Symbol) -> FeedResult<Option<LastPrice>> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| FeedError::HttpClient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            debug!(%symbol, "No last price available");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FeedError::HttpClient(format!("Failed to read response: {e}")))?;

        parse_last_price(&body)
    }
}

#[async_trait]
impl LastPriceSource for LastPriceClient {
    async fn last_price(&self, symbol: &Symbol) -> FeedResult<Option<LastPrice>> {
        self.fetch_last_price(symbol).await
    }
}

/// Parse a `{ "price": ..., "timestamp": ... }` body.
///
/// An empty body is treated like no content. `price` may be a JSON number
/// or a numeric string.
pub(crate) fn parse_last_price(body: &str) -> FeedResult<Option<LastPrice>> {
    if body.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| FeedError::InvalidResponse(format!("Failed to parse response: {e}")))?;

    let price = value
        .get("price")
        .and_then(numeric)
        .ok_or_else(|| FeedError::InvalidResponse(format!("Missing numeric price in {value}")))?;
    let timestamp = value.get("timestamp").and_then(Value::as_i64);

    Ok(Some(LastPrice { price, timestamp }))
}

/// Number, or string holding a number.
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
