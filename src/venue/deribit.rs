use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};

use crate::config::{Credentials, StreamConfig};
use crate::snapshot::PriceLevel;
use crate::util;

use super::{MarketInfo, MarketType, Markets, OptionRight, RawOrderbook, Venue, VenueError};

pub const VENUE_ID: &str = "deribit";

const WS_URL: &str = "wss://www.deribit.com/ws/api/v2";
const TEST_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";
const REST_URL: &str = "https://www.deribit.com/api/v2";
const TEST_REST_URL: &str = "https://test.deribit.com/api/v2";

/// Minimum gap between outgoing requests when rate limiting is on.
const REQUEST_SPACING: Duration = Duration::from_millis(50);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type StreamSlot = Arc<AsyncMutex<Option<WsStream>>>;

/// Deribit API v2 session
///
/// - Catalog: REST `public/get_instruments`
/// - Books: JSON-RPC over WebSocket, grouped book channel
///
/// Orderbook streams are isolated: every watched symbol gets its
/// own WebSocket with exactly one subscription. A read failure
/// drops that symbol's socket; the next `watch_order_book` call
/// connects and subscribes again.
pub struct DeribitVenue {
    ws_url: &'static str,
    rest_url: &'static str,
    credentials: Option<Credentials>,
    http: reqwest::Client,
    throttle: Option<Throttle>,
    streams: Mutex<HashMap<String, StreamSlot>>,
    next_id: AtomicU64,
}

impl DeribitVenue {
    pub fn new(config: &StreamConfig) -> Self {
        let (ws_url, rest_url) = if config.testnet {
            (TEST_WS_URL, TEST_REST_URL)
        } else {
            (WS_URL, REST_URL)
        };

        Self {
            ws_url,
            rest_url,
            credentials: config.credentials.clone(),
            http: reqwest::Client::new(),
            throttle: config.rate_limit.then(|| Throttle::new(REQUEST_SPACING)),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(&self, symbol: &str) -> StreamSlot {
        self.streams
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    async fn throttle(&self) {
        if let Some(t) = &self.throttle {
            t.wait().await;
        }
    }

    fn request(&self, method: &str, params: Value) -> Message {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        Message::Text(body.to_string().into())
    }

    /// Connects, authenticates when credentials are configured,
    /// and subscribes to the book channel of `symbol`.
    async fn open_stream(&self, symbol: &str, depth: usize) -> Result<WsStream, VenueError> {
        self.throttle().await;
        let (mut ws, _) = connect_async(self.ws_url)
            .await
            .map_err(|e| VenueError::Connect(e.to_string()))?;

        if let Some(c) = &self.credentials {
            self.throttle().await;
            let auth = self.request(
                "public/auth",
                json!({
                    "grant_type": "client_credentials",
                    "client_id": c.api_key,
                    "client_secret": c.api_secret,
                }),
            );
            ws.send(auth)
                .await
                .map_err(|e| VenueError::Connect(e.to_string()))?;
        }

        self.throttle().await;
        let sub = self.request(
            "public/subscribe",
            json!({ "channels": [book_channel(symbol, depth)] }),
        );
        ws.send(sub)
            .await
            .map_err(|e| VenueError::Connect(e.to_string()))?;

        Ok(ws)
    }
}

#[async_trait::async_trait]
impl Venue for DeribitVenue {
    fn id(&self) -> &str {
        VENUE_ID
    }

    async fn load_markets(&self) -> Result<Markets, VenueError> {
        self.throttle().await;
        let url = format!(
            "{}/public/get_instruments?currency=any&expired=false",
            self.rest_url
        );

        let body: Value = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| VenueError::Connect(e.to_string()))?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = body.get("error") {
            return Err(VenueError::Rejected(err.to_string()));
        }

        let instruments = body
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| VenueError::Protocol("get_instruments: missing result".into()))?;

        Ok(instruments
            .iter()
            .filter_map(parse_instrument)
            .map(|m| (m.symbol.clone(), m))
            .collect())
    }

    async fn watch_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Result<RawOrderbook, VenueError> {
        let slot = self.slot(symbol);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = Some(self.open_stream(symbol, depth).await?);
        }
        let Some(ws) = guard.as_mut() else {
            return Err(VenueError::Closed);
        };

        let result = next_book(ws).await;
        match result {
            Ok(mut book) => {
                if depth > 0 {
                    book.bids.truncate(depth);
                    book.asks.truncate(depth);
                }
                Ok(book)
            }
            Err(e) => {
                // Force a fresh connection on the next call
                *guard = None;
                Err(e)
            }
        }
    }

    async fn release(&self, symbol: &str) -> Result<(), VenueError> {
        // Unmapped first: a new watcher gets a fresh slot
        let slot = self.streams.lock().remove(symbol);
        let Some(slot) = slot else {
            return Ok(());
        };

        let ws = slot.lock().await.take();
        if let Some(mut ws) = ws {
            let _ = ws.close(None).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), VenueError> {
        let slots: Vec<StreamSlot> = self.streams.lock().drain().map(|(_, s)| s).collect();

        for slot in slots {
            if let Some(mut ws) = slot.lock().await.take() {
                let _ = ws.close(None).await;
            }
        }
        Ok(())
    }
}

/// Reads frames until the next book notification.
async fn next_book(ws: &mut WsStream) -> Result<RawOrderbook, VenueError> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => match parse_frame(&text) {
                Frame::Book(book) => return Ok(book),
                Frame::Control => {}
                Frame::Error(e) => return Err(VenueError::Rejected(e)),
                Frame::Malformed(e) => return Err(VenueError::Protocol(e)),
            },
            Ok(Message::Close(_)) => {
                return Err(VenueError::Disconnected("closed by venue".into()));
            }

            // Ignore non-text frames (ping/pong/binary)
            Ok(_) => {}

            Err(e) => return Err(VenueError::Disconnected(e.to_string())),
        }
    }
    Err(VenueError::Disconnected("stream ended".into()))
}

/// Grouped book channel; the venue only offers depths 1, 10 and 20.
fn book_channel(symbol: &str, depth: usize) -> String {
    let depth = match depth {
        0 | 1 => 1,
        2..=10 => 10,
        _ => 20,
    };
    format!("book.{symbol}.none.{depth}.100ms")
}

// ------------------------------------------------------------
// Parsing
// ------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Frame {
    Book(RawOrderbook),
    /// Acks, auth results, anything that is not book data
    Control,
    Error(String),
    Malformed(String),
}

/// Classifies one text frame. Never panics.
fn parse_frame(raw: &str) -> Frame {
    let v: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return Frame::Malformed(e.to_string()),
    };

    if let Some(err) = v.get("error") {
        return Frame::Error(err.to_string());
    }

    if v.get("method").and_then(Value::as_str) != Some("subscription") {
        return Frame::Control;
    }

    let params = &v["params"];
    let is_book = params["channel"]
        .as_str()
        .is_some_and(|c| c.starts_with("book."));
    if !is_book {
        return Frame::Control;
    }

    let data = &params["data"];
    let (Some(bids), Some(asks)) = (data["bids"].as_array(), data["asks"].as_array()) else {
        return Frame::Malformed("book notification without bids/asks".into());
    };

    Frame::Book(RawOrderbook {
        bids: parse_levels(bids),
        asks: parse_levels(asks),
        timestamp_ms: data["timestamp"].as_i64(),
    })
}

/// Accepts `[price, amount]` and raw-channel `[action, price, amount]`.
fn parse_levels(levels: &[Value]) -> Vec<PriceLevel> {
    levels
        .iter()
        .filter_map(|l| {
            let l = l.as_array()?;
            let n = l.len();
            if n < 2 {
                return None;
            }
            Some(PriceLevel::new(l[n - 2].as_f64()?, l[n - 1].as_f64()?))
        })
        .collect()
}

fn parse_instrument(v: &Value) -> Option<MarketInfo> {
    let symbol = v["instrument_name"].as_str()?;
    let kind = v["kind"].as_str().unwrap_or("unknown");

    let mut info = MarketInfo::new(symbol, MarketType::from_tag(kind));
    info.base_currency = v["base_currency"]
        .as_str()
        .map(str::to_string)
        .or_else(|| Some(util::base_from_symbol(symbol).to_string()));
    info.option_right = match v["option_type"].as_str() {
        Some("call") => Some(OptionRight::Call),
        Some("put") => Some(OptionRight::Put),
        _ => None,
    };
    info.expiry_ms = v["expiration_timestamp"].as_i64();
    info.raw = v.clone();
    Some(info)
}

// ------------------------------------------------------------
// Request spacing
// ------------------------------------------------------------

struct Throttle {
    spacing: Duration,
    next: AsyncMutex<Instant>,
}

impl Throttle {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next: AsyncMutex::new(Instant::now()),
        }
    }

    async fn wait(&self) {
        let mut next = self.next.lock().await;
        if *next > Instant::now() {
            sleep_until(*next).await;
        }
        *next = Instant::now() + self.spacing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_depth_is_rounded_up() {
        assert_eq!(book_channel("BTC-PERPETUAL", 1), "book.BTC-PERPETUAL.none.1.100ms");
        assert_eq!(book_channel("BTC-PERPETUAL", 5), "book.BTC-PERPETUAL.none.10.100ms");
        assert_eq!(book_channel("BTC-PERPETUAL", 20), "book.BTC-PERPETUAL.none.20.100ms");
        assert_eq!(book_channel("BTC-PERPETUAL", 50), "book.BTC-PERPETUAL.none.20.100ms");
    }

    #[test]
    fn book_notification() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "book.BTC-PERPETUAL.none.10.100ms",
                "data": {
                    "timestamp": 1700000000123,
                    "instrument_name": "BTC-PERPETUAL",
                    "change_id": 42,
                    "bids": [[100.0, 1.5], [99.5, 2]],
                    "asks": [[101.0, 2.0]]
                }
            }
        }"#;

        let Frame::Book(book) = parse_frame(raw) else {
            panic!("expected book frame");
        };
        assert_eq!(book.timestamp_ms, Some(1_700_000_000_123));
        assert_eq!(book.bids, vec![PriceLevel::new(100.0, 1.5), PriceLevel::new(99.5, 2.0)]);
        assert_eq!(book.asks, vec![PriceLevel::new(101.0, 2.0)]);
    }

    #[test]
    fn raw_channel_levels_skip_action() {
        let levels: Vec<Value> = serde_json::from_str(r#"[["new", 100.0, 1.0], ["delete", 99.0, 0]]"#).unwrap();
        assert_eq!(
            parse_levels(&levels),
            vec![PriceLevel::new(100.0, 1.0), PriceLevel::new(99.0, 0.0)]
        );
    }

    #[test]
    fn control_error_and_garbage_frames() {
        assert_eq!(
            parse_frame(r#"{"jsonrpc":"2.0","id":1,"result":["book.BTC-PERPETUAL.none.10.100ms"]}"#),
            Frame::Control
        );
        assert_eq!(
            parse_frame(r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"ticker.BTC-PERPETUAL.100ms","data":{}}}"#),
            Frame::Control
        );
        assert!(matches!(
            parse_frame(r#"{"jsonrpc":"2.0","id":2,"error":{"code":13004,"message":"invalid_credentials"}}"#),
            Frame::Error(e) if e.contains("invalid_credentials")
        ));
        assert!(matches!(parse_frame("not json"), Frame::Malformed(_)));
        assert!(matches!(
            parse_frame(r#"{"method":"subscription","params":{"channel":"book.X.none.1.100ms","data":{}}}"#),
            Frame::Malformed(_)
        ));
    }

    #[test]
    fn instrument_metadata() {
        let option = serde_json::json!({
            "instrument_name": "BTC-27DEC24-50000-C",
            "kind": "option",
            "base_currency": "BTC",
            "option_type": "call",
            "expiration_timestamp": 1735286400000_i64
        });
        let m = parse_instrument(&option).unwrap();
        assert_eq!(m.market_type, MarketType::Option);
        assert_eq!(m.option_right, Some(OptionRight::Call));
        assert_eq!(m.base_currency.as_deref(), Some("BTC"));
        assert_eq!(m.expiry_ms, Some(1_735_286_400_000));

        let combo = serde_json::json!({ "instrument_name": "BTC-FS-27DEC24_PERP", "kind": "future_combo" });
        let m = parse_instrument(&combo).unwrap();
        assert_eq!(m.market_type, MarketType::Other("future_combo".into()));
        assert_eq!(m.base_currency.as_deref(), Some("BTC"));

        assert!(parse_instrument(&serde_json::json!({ "kind": "future" })).is_none());
    }

    #[tokio::test]
    async fn release_forgets_the_symbol_slot() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let venue = DeribitVenue::new(&StreamConfig::new(VENUE_ID));
        venue.slot("BTC-PERPETUAL");
        venue.slot("ETH-PERPETUAL");

        venue.release("BTC-PERPETUAL").await.unwrap();
        venue.release("BTC-PERPETUAL").await.unwrap();

        let streams = venue.streams.lock();
        assert!(!streams.contains_key("BTC-PERPETUAL"));
        assert!(streams.contains_key("ETH-PERPETUAL"));
    }

    #[test]
    fn testnet_switches_endpoints() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let mut cfg = StreamConfig::new(VENUE_ID);
        cfg.testnet = true;
        let venue = DeribitVenue::new(&cfg);
        assert_eq!(venue.ws_url, TEST_WS_URL);
        assert_eq!(venue.rest_url, TEST_REST_URL);
        assert!(venue.throttle.is_some());
    }
}
