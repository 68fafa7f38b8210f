use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::Record;

/// Instrument kinds the collector subscribes to.
///
/// Catalog entries of any other type (spot, combos, ...) are
/// loaded but never partitioned into either set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Future,
    Option,
}

impl InstrumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Future => "future",
            InstrumentKind::Option => "option",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ------------------------------------------------------------
// Ticker schemas
// ------------------------------------------------------------
//
// Field contract per (venue, kind). Validation against it is
// advisory: callers decide whether to reject or only flag.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickerSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl TickerSchema {
    /// Required followed by optional fields.
    pub fn all_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }

    pub fn is_known(&self, field: &str) -> bool {
        self.all_fields().any(|f| f == field)
    }
}

pub const DERIBIT_FUTURE: TickerSchema = TickerSchema {
    required: &[
        "timestamp",
        "instrument_name",
        "exchange",
        "best_bid",
        "best_bid_amount",
        "best_ask",
        "best_ask_amount",
        "index_price",
    ],
    optional: &[
        "last_price",
        "mark_price",
        "current_funding",
        "funding_8h",
        "next_funding_time",
        "volume_24h",
        "volume_24h_usd",
        "open_interest",
        "delivery_price",
        "settlement_price",
        "price_change_24h",
        "price_change_24h_pct",
        "high_24h",
        "low_24h",
    ],
};

pub const DERIBIT_OPTION: TickerSchema = TickerSchema {
    required: &[
        "timestamp",
        "instrument_name",
        "exchange",
        "best_bid",
        "best_bid_amount",
        "best_ask",
        "best_ask_amount",
        "underlying_price",
        "index_price",
        "strike_price",
        "option_type",
        "expiry_timestamp",
    ],
    optional: &[
        "last_price",
        "mark_price",
        "delta",
        "gamma",
        "vega",
        "theta",
        "rho",
        "implied_volatility",
        "volume_24h",
        "open_interest",
    ],
};

/// Looks up the ticker schema for a venue and instrument kind.
///
/// Returns `None` for venues without a registered schema.
pub fn schema_for(venue: &str, kind: InstrumentKind) -> Option<&'static TickerSchema> {
    match (venue, kind) {
        ("deribit", InstrumentKind::Future) => Some(&DERIBIT_FUTURE),
        ("deribit", InstrumentKind::Option) => Some(&DERIBIT_OPTION),
        _ => None,
    }
}

/// Outcome of validating a ticker against its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub is_valid: bool,

    /// Required fields absent from the ticker, in schema order
    pub missing: Vec<String>,
}

// ------------------------------------------------------------
// Ticker snapshot
// ------------------------------------------------------------
//
// Schema-agnostic container: whatever fields the venue sent are
// kept verbatim in `fields`.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub venue: String,
    pub kind: InstrumentKind,
    pub fields: BTreeMap<String, Value>,
}

impl TickerSnapshot {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        venue: impl Into<String>,
        kind: InstrumentKind,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            venue: venue.into(),
            kind,
            fields,
        }
    }

    /// Schema registered for this ticker's venue and kind.
    pub fn schema(&self) -> Option<&'static TickerSchema> {
        schema_for(&self.venue, self.kind)
    }

    /// Checks presence of every required field.
    ///
    /// A field holding JSON null counts as present: the venue sent it.
    pub fn validate(&self, schema: &TickerSchema) -> Validation {
        let missing: Vec<String> = schema
            .required
            .iter()
            .filter(|f| !self.fields.contains_key(**f))
            .map(|f| f.to_string())
            .collect();

        Validation {
            is_valid: missing.is_empty(),
            missing,
        }
    }

    /// Identity columns followed by every field verbatim.
    ///
    /// Identity columns win if the field map repeats one of them.
    pub fn to_record(&self) -> Record {
        let mut row = Record::new();
        row.insert("symbol".into(), Value::from(self.symbol.as_str()));
        row.insert("timestamp".into(), Value::from(self.timestamp.timestamp_millis()));
        row.insert("venue".into(), Value::from(self.venue.as_str()));
        row.insert("kind".into(), Value::from(self.kind.as_str()));

        for (k, v) in &self.fields {
            row.entry(k.clone()).or_insert_with(|| v.clone());
        }
        row
    }
}

// ------------------------------------------------------------
// Outbound message
// ------------------------------------------------------------
//
// Envelope for records leaving the process (see `sink`).
// The `type` tag is used for routing on the receiving side.
//
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Book(Record),
    Ticker(Record),
}
