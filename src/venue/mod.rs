//! Venue connectivity layer
//!
//! This module provides:
//! - The `Venue` capability trait the collector talks to
//! - Venue-neutral market metadata and raw book types
//! - A registry resolving venue identifiers to implementations
//!
//! All venue-specific protocol logic lives in the submodules.
//! The collector interacts exclusively through `Venue`.

pub mod deribit;
pub mod sim;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StreamConfig;
use crate::snapshot::PriceLevel;

// ------------------------------------------------------------
// Errors
// ------------------------------------------------------------

/// Failures reported by a venue.
///
/// Every variant is treated as transient by the stream supervisor;
/// only `start()` surfaces them to the caller.
#[derive(Debug, thiserror::Error)]
pub enum VenueError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("malformed venue message: {0}")]
    Protocol(String),

    #[error("venue rejected request: {0}")]
    Rejected(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("session closed")]
    Closed,
}

// ------------------------------------------------------------
// Market metadata
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Future,
    Option,
    #[serde(untagged)]
    Other(String),
}

impl MarketType {
    /// Maps a venue type tag onto a market type.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "future" => MarketType::Future,
            "option" => MarketType::Option,
            other => MarketType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    #[serde(rename = "C", alias = "call")]
    Call,
    #[serde(rename = "P", alias = "put")]
    Put,
}

impl OptionRight {
    /// Single-letter code used in option symbols ("C" / "P").
    pub fn code(&self) -> &'static str {
        match self {
            OptionRight::Call => "C",
            OptionRight::Put => "P",
        }
    }
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Catalog entry for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,

    /// Type tag as supplied by the venue
    pub market_type: MarketType,

    pub base_currency: Option<String>,

    /// Only set for options
    pub option_right: Option<OptionRight>,

    /// Expiry in ms since epoch (dated futures and options)
    pub expiry_ms: Option<i64>,

    /// Untouched venue payload
    #[serde(default)]
    pub raw: Value,
}

impl MarketInfo {
    pub fn new(symbol: impl Into<String>, market_type: MarketType) -> Self {
        Self {
            symbol: symbol.into(),
            market_type,
            base_currency: None,
            option_right: None,
            expiry_ms: None,
            raw: Value::Null,
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base_currency = Some(base.into());
        self
    }

    pub fn with_right(mut self, right: OptionRight) -> Self {
        self.option_right = Some(right);
        self
    }
}

pub type Markets = HashMap<String, MarketInfo>;

/// One book update as delivered by a venue.
///
/// `timestamp_ms` is absent when the venue did not supply one;
/// the consumer substitutes its own clock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOrderbook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp_ms: Option<i64>,
}

impl RawOrderbook {
    pub fn new(bids: &[[f64; 2]], asks: &[[f64; 2]]) -> Self {
        Self {
            bids: bids.iter().copied().map(PriceLevel::from).collect(),
            asks: asks.iter().copied().map(PriceLevel::from).collect(),
            timestamp_ms: None,
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

// ------------------------------------------------------------
// Capability interface
// ------------------------------------------------------------
//
// One instance represents one session with a venue and is shared
// by every stream supervisor of a collector.
//
#[async_trait::async_trait]
pub trait Venue: Send + Sync {
    /// Canonical venue identifier (e.g. "deribit").
    fn id(&self) -> &str;

    /// Fetches the full instrument catalog.
    async fn load_markets(&self) -> Result<Markets, VenueError>;

    /// Suspends until the next book update for `symbol` is available.
    ///
    /// Implementations establish the underlying stream lazily and
    /// must re-establish it on the call following a failure.
    async fn watch_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Result<RawOrderbook, VenueError>;

    /// Drops whatever the session holds for `symbol` alone.
    ///
    /// Called once nobody watches the symbol any more; a later
    /// `watch_order_book` for it starts from scratch.
    async fn release(&self, symbol: &str) -> Result<(), VenueError> {
        let _ = symbol;
        Ok(())
    }

    /// Releases every connection held by the session.
    async fn close(&self) -> Result<(), VenueError>;
}

// ------------------------------------------------------------
// Registry
// ------------------------------------------------------------

pub type VenueFactory = Arc<dyn Fn(&StreamConfig) -> Arc<dyn Venue> + Send + Sync>;

/// Maps venue identifiers to session factories.
///
/// Keeps venue construction in one place; an identifier missing
/// from the registry is a usage error for the caller.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    factories: HashMap<String, VenueFactory>,
}

impl VenueRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every venue compiled into this crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(deribit::VENUE_ID, |cfg| {
            Arc::new(deribit::DeribitVenue::new(cfg)) as Arc<dyn Venue>
        });
        registry
    }

    /// Adds or replaces the factory for `id`.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&StreamConfig) -> Arc<dyn Venue> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Builds a session for `config.venue`, if registered.
    pub fn create(&self, config: &StreamConfig) -> Option<Arc<dyn Venue>> {
        self.factories.get(&config.venue).map(|f| f(config))
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for VenueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VenueRegistry")
            .field("venues", &self.ids())
            .finish()
    }
}
