//! Collector for one venue
//!
//! This module groups all logic responsible for:
//! - Loading and partitioning the venue's instrument catalog
//! - Tracking subscriptions and running one supervisor per symbol
//! - Holding the latest orderbook per symbol and bounded history
//! - Serving read and query APIs over that state
//!
//! Venue protocol details live behind `venue::Venue`; consumer
//! notification goes through `handler::StreamHandler`.

pub mod catalog;
mod state;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::logging::LogContext;
use crate::metrics::METRICS;
use crate::schema::InstrumentKind;
use crate::snapshot::{OrderbookSnapshot, Table};
use crate::venue::{MarketInfo, OptionRight, Venue, VenueError, VenueRegistry};

use catalog::Catalog;
use state::Shared;
use supervisor::{ExitReason, Supervisor, SupervisorState};

/// Errors surfaced to collector callers.
///
/// Stream failures are never reported here; they stay inside the
/// supervisors (see `StreamHandler::on_error`).
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("collector not running, call start() first")]
    NotRunning,

    #[error("markets not loaded, call start() first")]
    MarketsNotLoaded,

    #[error("venue '{0}' is not supported")]
    UnknownVenue(String),

    #[error(transparent)]
    Venue(#[from] VenueError),
}

struct SupervisorTask {
    symbol: String,
    ticket: u64,
    handle: JoinHandle<ExitReason>,
}

/// Streams orderbooks for many instruments of one venue.
///
/// Lifecycle: `start()` → `subscribe*()` / reads → `stop()`.
///
/// All methods take `&self`; the collector can be shared behind
/// an `Arc` or held by a `MultiVenueCollector`.
pub struct Collector {
    config: StreamConfig,
    venue: Arc<dyn Venue>,
    shared: Arc<Shared>,
    catalog: RwLock<Option<Catalog>>,
    tasks: Mutex<Vec<SupervisorTask>>,
    log: Mutex<LogContext>,
}

impl Collector {
    /// Resolves the venue through `registry`.
    pub fn new(config: StreamConfig, registry: &VenueRegistry) -> Result<Self, CollectorError> {
        let venue = registry
            .create(&config)
            .ok_or_else(|| CollectorError::UnknownVenue(config.venue.clone()))?;
        Ok(Self::with_venue(config, venue))
    }

    /// Uses an already constructed venue session.
    pub fn with_venue(config: StreamConfig, venue: Arc<dyn Venue>) -> Self {
        let shared = Arc::new(Shared::new(
            config.store_snapshots,
            config.max_snapshots_per_symbol,
        ));
        let log = LogContext::new(config.venue.clone());

        Self {
            config,
            venue,
            shared,
            catalog: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            log: Mutex::new(log),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn venue_id(&self) -> &str {
        &self.config.venue
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    fn log(&self) -> LogContext {
        self.log.lock().clone()
    }

    // ------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------

    /// Loads the catalog and marks the collector running.
    ///
    /// Fails with the venue's error when the session cannot be
    /// established. Calling it on a running collector only reloads
    /// the catalog.
    pub async fn start(&self) -> Result<(), CollectorError> {
        {
            let mut log = self.log.lock();
            if log.is_released() {
                *log = LogContext::new(self.config.venue.clone());
            }
        }
        let log = self.log();
        log.info(format_args!("initializing {} connection", self.config.venue));

        if let Err(e) = self.reload_markets().await {
            log.error(format_args!("failed to connect: {e}"));
            return Err(e);
        }

        if !self.shared.set_running(true) {
            METRICS.venues_active.fetch_add(1, Ordering::Relaxed);
        }
        log.info(format_args!("connected to {}", self.config.venue));
        Ok(())
    }

    /// Stops every supervisor, clears the subscription registry and
    /// closes the venue session.
    ///
    /// Safe to call repeatedly and when supervisors have already
    /// ended on their own. Cached books and history are kept.
    pub async fn stop(&self) {
        let log = self.log();
        log.info(format_args!("stopping collector"));

        if self.shared.set_running(false) {
            METRICS.venues_active.fetch_sub(1, Ordering::Relaxed);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            if !task.handle.is_finished() {
                task.handle.abort();
            }
        }

        let mut cancelled = Vec::new();
        for task in tasks {
            match task.handle.await {
                Ok(reason) => {
                    log.debug(format_args!("{} supervisor finished: {:?}", task.symbol, reason));
                }
                Err(e) if e.is_cancelled() => cancelled.push((task.symbol, task.ticket)),
                Err(e) => {
                    log.error(format_args!("{} supervisor panicked: {e}", task.symbol));
                }
            }
        }
        self.shared.finish_stop(&cancelled);

        if let Err(e) = self.venue.close().await {
            log.warn(format_args!("error closing venue session: {e}"));
        }

        log.info(format_args!("collector stopped"));
        log.release();
    }

    // ------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------

    /// Fetches and re-partitions the instrument catalog.
    pub async fn reload_markets(&self) -> Result<(), CollectorError> {
        let log = self.log();
        log.info(format_args!("loading markets"));

        let markets = self.venue.load_markets().await?;
        let catalog = Catalog::partition(markets);

        log.info(format_args!(
            "loaded {} futures and {} options markets ({} other)",
            catalog.futures_len(),
            catalog.options_len(),
            catalog.skipped()
        ));
        *self.catalog.write() = Some(catalog);
        Ok(())
    }

    pub fn markets_loaded(&self) -> bool {
        self.catalog.read().is_some()
    }

    /// Futures in the catalog, sorted, optionally by base currency.
    pub fn available_futures(&self, base: Option<&str>) -> Result<Vec<String>, CollectorError> {
        self.catalog
            .read()
            .as_ref()
            .map(|c| c.futures(base))
            .ok_or(CollectorError::MarketsNotLoaded)
    }

    /// Options in the catalog, sorted, filtered by base currency,
    /// right and an expiry substring (e.g. "27DEC24").
    pub fn available_options(
        &self,
        base: Option<&str>,
        right: Option<OptionRight>,
        expiry: Option<&str>,
    ) -> Result<Vec<String>, CollectorError> {
        self.catalog
            .read()
            .as_ref()
            .map(|c| c.options(base, right, expiry))
            .ok_or(CollectorError::MarketsNotLoaded)
    }

    /// Catalog entry for `symbol`; loads the catalog first if needed.
    pub async fn market_info(&self, symbol: &str) -> Result<Option<MarketInfo>, CollectorError> {
        if !self.markets_loaded() {
            self.reload_markets().await?;
        }
        Ok(self
            .catalog
            .read()
            .as_ref()
            .and_then(|c| c.get(symbol).cloned()))
    }

    // ------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------

    /// Starts one supervisor per symbol not yet subscribed.
    ///
    /// Returns the number of supervisors spawned. Symbols already
    /// subscribed (under either kind) are skipped.
    pub fn subscribe<S: AsRef<str>>(
        &self,
        symbols: &[S],
        kind: InstrumentKind,
    ) -> Result<usize, CollectorError> {
        if !self.is_running() {
            return Err(CollectorError::NotRunning);
        }

        let log = self.log();
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());

        let mut spawned = 0;
        for symbol in symbols.iter().map(AsRef::as_ref) {
            let Some(ticket) = self.shared.state.write().subscriptions.insert(symbol, kind) else {
                continue;
            };
            self.shared.record_state(symbol, ticket, SupervisorState::Idle);

            let supervisor = Supervisor {
                symbol: symbol.to_string(),
                kind,
                ticket,
                venue: Arc::clone(&self.venue),
                venue_id: self.config.venue.clone(),
                shared: Arc::clone(&self.shared),
                handler: self.config.handler.clone(),
                depth: self.config.depth,
                reconnect_delay: self.config.reconnect_delay(),
                max_attempts: self.config.max_reconnect_attempts,
                log: log.clone(),
            };

            tasks.push(SupervisorTask {
                symbol: symbol.to_string(),
                ticket,
                handle: tokio::spawn(supervisor.run()),
            });
            spawned += 1;
            log.info(format_args!("subscribed to {kind} orderbook: {symbol}"));
        }

        Ok(spawned)
    }

    pub fn subscribe_futures<S: AsRef<str>>(&self, symbols: &[S]) -> Result<usize, CollectorError> {
        self.subscribe(symbols, InstrumentKind::Future)
    }

    pub fn subscribe_options<S: AsRef<str>>(&self, symbols: &[S]) -> Result<usize, CollectorError> {
        self.subscribe(symbols, InstrumentKind::Option)
    }

    /// Subscribes to every catalog future matching `base`.
    pub fn subscribe_all_futures(&self, base: Option<&str>) -> Result<usize, CollectorError> {
        let symbols = self.available_futures(base)?;
        self.subscribe(&symbols, InstrumentKind::Future)
    }

    /// Subscribes to every catalog option matching the filters.
    pub fn subscribe_all_options(
        &self,
        base: Option<&str>,
        right: Option<OptionRight>,
        expiry: Option<&str>,
    ) -> Result<usize, CollectorError> {
        let symbols = self.available_options(base, right, expiry)?;
        self.subscribe(&symbols, InstrumentKind::Option)
    }

    /// Removes `symbol` from the registry.
    ///
    /// The supervisor is not interrupted; it notices at its next
    /// loop check and exits.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let removed = self.shared.state.write().subscriptions.remove(symbol);
        if removed {
            self.log().info(format_args!("unsubscribed from: {symbol}"));
        }
        removed
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.shared.state.read().subscriptions.contains(symbol)
    }

    /// Subscribed symbols of one kind, sorted.
    pub fn subscribed(&self, kind: InstrumentKind) -> Vec<String> {
        self.shared.state.read().subscriptions.symbols(kind)
    }

    /// Supervisors for `symbol` whose task has not finished yet.
    pub fn active_supervisors(&self, symbol: &str) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| t.symbol == symbol && !t.handle.is_finished())
            .count()
    }

    /// Last recorded state of the newest supervisor for `symbol`.
    pub fn supervisor_state(&self, symbol: &str) -> Option<SupervisorState> {
        self.shared
            .state
            .read()
            .supervisors
            .get(symbol)
            .map(|(_, s)| *s)
    }

    // ------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------

    pub fn latest(&self, symbol: &str) -> Option<Arc<OrderbookSnapshot>> {
        self.shared.state.read().orderbooks.get(symbol).cloned()
    }

    /// Point-in-time copy of the whole cache.
    pub fn all_orderbooks(&self) -> HashMap<String, Arc<OrderbookSnapshot>> {
        self.shared.state.read().orderbooks.clone()
    }

    /// Oldest first; `Some(n)` returns only the most recent `n`.
    pub fn history(&self, symbol: &str, limit: Option<usize>) -> Vec<Arc<OrderbookSnapshot>> {
        self.shared.state.read().history.get(symbol, limit)
    }

    /// Current cache as fixed-shape rows, sorted by symbol.
    pub fn orderbooks_table(&self) -> Table {
        let state = self.shared.state.read();
        let mut books: Vec<&Arc<OrderbookSnapshot>> = state.orderbooks.values().collect();
        books.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        books.iter().map(|s| s.to_record()).collect()
    }

    /// Cached books of currently subscribed futures.
    pub fn futures_orderbooks(&self) -> HashMap<String, Arc<OrderbookSnapshot>> {
        self.orderbooks_of(InstrumentKind::Future)
    }

    /// Cached books of currently subscribed options.
    pub fn options_orderbooks(&self) -> HashMap<String, Arc<OrderbookSnapshot>> {
        self.orderbooks_of(InstrumentKind::Option)
    }

    fn orderbooks_of(&self, kind: InstrumentKind) -> HashMap<String, Arc<OrderbookSnapshot>> {
        let state = self.shared.state.read();
        state
            .orderbooks
            .iter()
            .filter(|(symbol, _)| state.subscriptions.contains_kind(symbol, kind))
            .map(|(symbol, book)| (symbol.clone(), Arc::clone(book)))
            .collect()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if self.shared.set_running(false) {
            METRICS.venues_active.fetch_sub(1, Ordering::Relaxed);
        }
        for task in self.tasks.get_mut().drain(..) {
            task.handle.abort();
        }
    }
}
