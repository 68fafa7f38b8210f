use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Number of bid and ask levels every flattened record carries.
///
/// Records always have this many `bid_price_N` / `bid_size_N` /
/// `ask_price_N` / `ask_size_N` columns, null-filled beyond the
/// actual book depth, so heterogeneous symbols and venues produce
/// rows of identical shape.
pub const RECORD_DEPTH: usize = 10;

/// One flattened row.
pub type Record = Map<String, Value>;

// ------------------------------------------------------------
// Price level
// ------------------------------------------------------------

/// A single `(price, size)` level of one book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

impl From<[f64; 2]> for PriceLevel {
    fn from([price, size]: [f64; 2]) -> Self {
        Self { price, size }
    }
}

// ------------------------------------------------------------
// Orderbook snapshot
// ------------------------------------------------------------
//
// Built once per received venue update and never mutated.
// A newer update for the same symbol produces a new snapshot
// which replaces this one in the cache.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    /// Instrument identifier as the venue names it
    /// Example: "BTC-PERPETUAL", "BTC-27DEC24-50000-C"
    pub symbol: String,

    pub timestamp: DateTime<Utc>,

    /// Bid levels, best (highest) price first
    pub bids: Vec<PriceLevel>,

    /// Ask levels, best (lowest) price first
    pub asks: Vec<PriceLevel>,

    /// Venue identifier (e.g. "deribit")
    pub venue: String,
}

impl OrderbookSnapshot {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        venue: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            bids,
            asks,
            venue: venue.into(),
        }
    }

    /// Price of the first bid level.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    /// Price of the first ask level.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        Some((bid + ask) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        Some(ask - bid)
    }

    /// Flattens the snapshot into a fixed-shape record.
    ///
    /// Columns:
    /// - symbol, timestamp (ms since epoch), venue
    /// - best_bid, best_ask, mid_price, spread (null when undefined)
    /// - bid_price_0..9, bid_size_0..9, ask_price_0..9, ask_size_0..9
    ///
    /// Levels deeper than `RECORD_DEPTH` are not emitted; missing
    /// levels are emitted as null, never omitted.
    pub fn to_record(&self) -> Record {
        let mut row = Record::new();

        row.insert("symbol".into(), Value::from(self.symbol.as_str()));
        row.insert("timestamp".into(), Value::from(self.timestamp.timestamp_millis()));
        row.insert("venue".into(), Value::from(self.venue.as_str()));

        row.insert("best_bid".into(), opt_number(self.best_bid()));
        row.insert("best_ask".into(), opt_number(self.best_ask()));
        row.insert("mid_price".into(), opt_number(self.mid_price()));
        row.insert("spread".into(), opt_number(self.spread()));

        push_levels(&mut row, "bid", &self.bids);
        push_levels(&mut row, "ask", &self.asks);

        row
    }

    /// Returns true when bids are price-descending and asks price-ascending.
    pub fn is_well_ordered(&self) -> bool {
        self.bids.windows(2).all(|w| w[0].price >= w[1].price)
            && self.asks.windows(2).all(|w| w[0].price <= w[1].price)
    }

    /// Sorts both sides into book order. Stable for equal prices.
    pub fn into_well_ordered(mut self) -> Self {
        self.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        self
    }
}

fn push_levels(row: &mut Record, side: &str, levels: &[PriceLevel]) {
    for i in 0..RECORD_DEPTH {
        let level = levels.get(i);
        row.insert(
            format!("{side}_price_{i}"),
            opt_number(level.map(|l| l.price)),
        );
        row.insert(
            format!("{side}_size_{i}"),
            opt_number(level.map(|l| l.size)),
        );
    }
}

/// Non-finite floats have no JSON representation and become null.
fn opt_number(v: Option<f64>) -> Value {
    v.and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ------------------------------------------------------------
// Tabular projection
// ------------------------------------------------------------
//
// Bulk view over many snapshots: one fixed-shape record per row.
// Used by the collector read API and cross-venue comparison.
//
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub rows: Vec<Record>,
}

impl Table {
    pub fn new(rows: Vec<Record>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names of the first row, in insertion order.
    pub fn columns(&self) -> Vec<&str> {
        self.rows
            .first()
            .map(|r| r.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All values of one column; rows lacking it yield null.
    pub fn column(&self, name: &str) -> Vec<&Value> {
        self.rows
            .iter()
            .map(|r| r.get(name).unwrap_or(&Value::Null))
            .collect()
    }

    /// One JSON object per line.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&serde_json::to_string(row)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl FromIterator<Record> for Table {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
