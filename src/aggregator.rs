use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::collector::{Collector, CollectorError};
use crate::config::StreamConfig;
use crate::snapshot::{OrderbookSnapshot, Table};
use crate::venue::VenueRegistry;

/// Runs one `Collector` per venue.
///
/// Venues are keyed by identifier; adding a venue twice keeps the
/// first collector. Iteration follows identifier order, so tables
/// built across venues have a stable row order.
pub struct MultiVenueCollector {
    registry: VenueRegistry,
    collectors: BTreeMap<String, Collector>,
}

impl MultiVenueCollector {
    pub fn new(registry: VenueRegistry) -> Self {
        Self {
            registry,
            collectors: BTreeMap::new(),
        }
    }

    /// Builds, starts and registers a collector for `config.venue`.
    ///
    /// Returns `Ok(false)` when the venue is already registered. A
    /// collector that fails to start is not registered.
    pub async fn add_venue(&mut self, config: StreamConfig) -> Result<bool, CollectorError> {
        if self.collectors.contains_key(&config.venue) {
            log::warn!("venue '{}' already added, ignoring", config.venue);
            return Ok(false);
        }

        let venue = config.venue.clone();
        let collector = Collector::new(config, &self.registry)?;
        collector.start().await?;

        log::info!("venue '{venue}' added");
        self.collectors.insert(venue, collector);
        Ok(true)
    }

    /// Stops every collector and forgets them.
    pub async fn stop_all(&mut self) {
        for (venue, collector) in std::mem::take(&mut self.collectors) {
            collector.stop().await;
            log::info!("venue '{venue}' stopped");
        }
    }

    pub fn collector(&self, venue: &str) -> Option<&Collector> {
        self.collectors.get(venue)
    }

    /// Registered venue identifiers, sorted.
    pub fn venues(&self) -> Vec<&str> {
        self.collectors.keys().map(String::as_str).collect()
    }

    /// Latest books of every venue: venue → symbol → snapshot.
    pub fn all_orderbooks(&self) -> HashMap<String, HashMap<String, Arc<OrderbookSnapshot>>> {
        self.collectors
            .iter()
            .map(|(venue, c)| (venue.clone(), c.all_orderbooks()))
            .collect()
    }

    /// One row per venue holding a book for `symbol`.
    ///
    /// Each row's `venue` column names the collector it came from.
    /// Empty when no venue has seen the symbol.
    pub fn compare(&self, symbol: &str) -> Table {
        self.collectors
            .iter()
            .filter_map(|(venue, c)| {
                let mut row = c.latest(symbol)?.to_record();
                row.insert("venue".into(), Value::from(venue.as_str()));
                Some(row)
            })
            .collect()
    }
}
