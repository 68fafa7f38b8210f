use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::handler::StreamHandler;
use crate::venue::OptionRight;

// ------------------------------------------------------------
// Stream configuration
// ------------------------------------------------------------
//
// Everything one collector needs: which venue, how to talk to
// it, how to retry, how much history to keep, and who to notify.
//
// Every field has a default, so `{"venue": "deribit"}` is a
// complete configuration. The handler is attached in code.
//
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Venue identifier resolved through the venue registry
    pub venue: String,

    /// API credentials; public market data works without them
    pub credentials: Option<Credentials>,

    /// Connect to the venue's test environment
    pub testnet: bool,

    /// Requested book depth per side
    pub depth: usize,

    /// Flat delay between reconnect attempts
    pub reconnect_delay_ms: u64,

    /// Consecutive failures after which a symbol is given up
    pub max_reconnect_attempts: u32,

    /// Space outgoing venue requests
    pub rate_limit: bool,

    /// Keep per-symbol snapshot history
    pub store_snapshots: bool,

    /// History bound per symbol
    pub max_snapshots_per_symbol: usize,

    #[serde(skip)]
    pub handler: Option<Arc<dyn StreamHandler>>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            venue: "deribit".to_string(),
            credentials: None,
            testnet: false,
            depth: 20,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            rate_limit: true,
            store_snapshots: true,
            max_snapshots_per_symbol: 1_000,
            handler: None,
        }
    }
}

impl StreamConfig {
    pub fn new(venue: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn with_handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_credentials(mut self, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        });
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_history(mut self, max_snapshots_per_symbol: usize) -> Self {
        self.store_snapshots = true;
        self.max_snapshots_per_symbol = max_snapshots_per_symbol;
        self
    }

    pub fn without_history(mut self) -> Self {
        self.store_snapshots = false;
        self
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("venue", &self.venue)
            .field("credentials", &self.credentials)
            .field("testnet", &self.testnet)
            .field("depth", &self.depth)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("rate_limit", &self.rate_limit)
            .field("store_snapshots", &self.store_snapshots)
            .field("max_snapshots_per_symbol", &self.max_snapshots_per_symbol)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

/// API key pair. The secret never appears in debug output.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

// ------------------------------------------------------------
// Root configuration (binary)
// ------------------------------------------------------------
//
// Loaded from `config.json`.
//
// It defines:
// - Venues to collect from and their symbols
// - Optional forwarding of snapshots to a master service
// - Optional debug configuration
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub venues: Vec<VenueConfig>,

    pub master: Option<MasterConfig>,

    pub debug: Option<DebugConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VenueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub stream: StreamConfig,

    /// Futures to subscribe to, as the venue names them
    #[serde(default)]
    pub futures: Vec<String>,

    /// Options to subscribe to
    #[serde(default)]
    pub options: Vec<String>,

    /// Catalog-wide subscription by filter
    pub subscribe_all: Option<SubscribeAll>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SubscribeAll {
    pub futures: bool,
    pub options: bool,
    pub base_currency: Option<String>,
    pub option_right: Option<OptionRight>,
    pub expiry: Option<String>,
}

// ------------------------------------------------------------
// Master configuration
// ------------------------------------------------------------
//
// Where the forwarding sink sends records.
//
// Notes:
// - The `key` is security-sensitive and must never be committed.
// - `demo` logs records instead of sending them.
//
#[derive(Debug, Deserialize, Clone)]
pub struct MasterConfig {
    /// WebSocket URL of the master service
    pub url: String,

    /// Number of parallel connections
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Sent during login as key=XYZ&role=collector
    pub key: String,

    pub demo: Option<bool>,

    /// Per-connection queue bound; records beyond it are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Log every forwarded record
    pub log: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_connections() -> usize {
    1
}

fn default_queue_size() -> usize {
    10_000
}
