//! Per-symbol server-push price streams.
//!
//! A stream is opened synchronously: failing to build the request (bad
//! URL, no runtime) is reported immediately so the caller can fall back to
//! polling. Everything after that (connect errors, bad status, end of body)
//! surfaces as a single `StreamUpdate::Error` on the update channel.

use crate::error::{FeedError, FeedResult};
use crate::rest::numeric;
use futures_util::StreamExt;
use livefeed_core::Symbol;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_BUFFER: usize = 64;

/// Update delivered by an open stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// Raw price from a `type == "price"` message. Not yet noise-filtered.
    Price(f64),
    /// The stream failed and will deliver nothing more.
    Error(String),
}

/// Receiving end of an open stream. Dropping it closes the stream.
#[derive(Debug)]
pub struct PriceStream {
    updates: mpsc::Receiver<StreamUpdate>,
    cancel: CancellationToken,
}

impl PriceStream {
    pub fn new(updates: mpsc::Receiver<StreamUpdate>, cancel: CancellationToken) -> Self {
        Self { updates, cancel }
    }

    /// Next update, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<StreamUpdate> {
        self.updates.recv().await
    }

    /// Token that closes the stream when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PriceStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens per-symbol price streams.
pub trait PriceStreamSource: Send + Sync + 'static {
    /// Open a stream for `symbol`. An `Err` here means no stream exists.
    fn open(&self, symbol: &Symbol) -> FeedResult<PriceStream>;
}

/// Server-Sent Events source for `GET {origin}{path}?symbol=SYM`.
pub struct SseStreamSource {
    client: Client,
    origin: String,
    path: String,
}

impl SseStreamSource {
    pub fn new(origin: impl Into<String>, path: impl Into<String>) -> FeedResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| FeedError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            origin: origin.into(),
            path: path.into(),
        })
    }

    fn stream_url(&self, symbol: &Symbol) -> FeedResult<Url> {
        let raw = format!("{}{}", self.origin.trim_end_matches('/'), self.path);
        let mut url = Url::parse(&raw).map_err(|e| FeedError::InvalidUrl(format!("{raw}: {e}")))?;
        url.query_pairs_mut().append_pair("symbol", symbol.as_str());
        Ok(url)
    }
}

impl PriceStreamSource for SseStreamSource {
    fn open(&self, symbol: &Symbol) -> FeedResult<PriceStream> {
        let url = self.stream_url(symbol)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeedError::Stream(format!("No runtime to drive stream: {e}")))?;

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let cancel = CancellationToken::new();
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream");

        debug!(%symbol, "Opening price stream");
        runtime.spawn(run_event_stream(symbol.clone(), request, tx, cancel.clone()));

        Ok(PriceStream::new(rx, cancel))
    }
}

async fn run_event_stream(
    symbol: Symbol,
    request: RequestBuilder,
    tx: mpsc::Sender<StreamUpdate>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%symbol, "Price stream closed");
            return;
        }
        outcome = pump_events(request, &tx) => outcome,
    };

    if cancel.is_cancelled() {
        return;
    }
    let reason = match outcome {
        Ok(()) => "stream ended".to_string(),
        Err(e) => e.to_string(),
    };
    warn!(%symbol, %reason, "Price stream failed");
    let _ = tx.send(StreamUpdate::Error(reason)).await;
}

async fn pump_events(request: RequestBuilder, tx: &mpsc::Sender<StreamUpdate>) -> FeedResult<()> {
    let response = request
        .send()
        .await
        .map_err(|e| FeedError::Stream(format!("Connect failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status {
            status: status.as_u16(),
            body: String::new(),
        });
    }

    let mut body = response.bytes_stream();
    let mut decoder = EventDecoder::default();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FeedError::Stream(format!("Read failed: {e}")))?;
        for price in decoder.push(&chunk) {
            if tx.send(StreamUpdate::Price(price)).await.is_err() {
                return Ok(());
            }
        }
    }
    if let Some(price) = decoder.finish() {
        let _ = tx.send(StreamUpdate::Price(price)).await;
    }
    Ok(())
}

/// Incremental event-stream decoder.
///
/// Consecutive `data:` fields are joined with `\n` and parsed when the
/// blank line closing the event arrives. Comments and other fields are
/// skipped.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    pending: Vec<u8>,
    data: Option<String>,
}

impl EventDecoder {
    /// Feed a body chunk, returning prices from every completed event.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<f64> {
        self.pending.extend_from_slice(chunk);

        let mut prices = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(price) = self.process_line(line.trim_end_matches(['\n', '\r'])) {
                prices.push(price);
            }
        }
        prices
    }

    /// Flush an event left open when the body ended without a blank line.
    pub(crate) fn finish(&mut self) -> Option<f64> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&line);
            if let Some(price) = self.process_line(line.trim_end_matches('\r')) {
                return Some(price);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<f64> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        None
    }

    fn dispatch(&mut self) -> Option<f64> {
        let payload = self.data.take()?;
        parse_event_data(&payload)
    }
}

/// Price from an event payload shaped `{"type":"price","price":...}`.
pub(crate) fn parse_event_data(payload: &str) -> Option<f64> {
    let value: Value = match serde_json::from_str(payload.trim()) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "Ignoring non-JSON event");
            return None;
        }
    };
    if value.get("type").and_then(Value::as_str) != Some("price") {
        return None;
    }
    value.get("price").and_then(numeric)
}
