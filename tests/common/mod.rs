#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

use deriv_book_collector::venue::sim::SimulatedVenue;
use deriv_book_collector::{
    Collector, MarketInfo, MarketType, OrderbookSnapshot, StreamConfig, StreamHandler, Venue,
    VenueError,
};

/// Polls `cond` every few milliseconds; panics after two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let polled = timeout(Duration::from_secs(2), async {
        while !cond() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Gives spawned supervisors a chance to run.
pub async fn settle() {
    sleep(Duration::from_millis(30)).await;
}

/// Handler recording every callback in arrival order.
#[derive(Default)]
pub struct Recorder {
    pub updates: Mutex<Vec<OrderbookSnapshot>>,
    pub errors: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn updates(&self) -> usize {
        self.updates.lock().len()
    }

    pub fn errors(&self) -> usize {
        self.errors.lock().len()
    }
}

#[async_trait::async_trait]
impl StreamHandler for Recorder {
    async fn on_orderbook_update(&self, snapshot: &OrderbookSnapshot) -> anyhow::Result<()> {
        self.updates.lock().push(snapshot.clone());
        Ok(())
    }

    async fn on_error(&self, symbol: &str, error: &VenueError) -> anyhow::Result<()> {
        self.errors.lock().push(format!("{symbol}: {error}"));
        Ok(())
    }
}

pub fn sim_venue(id: &str) -> Arc<SimulatedVenue> {
    Arc::new(SimulatedVenue::new(id).with_markets([
        MarketInfo::new("BTC-PERP", MarketType::Future).with_base("BTC"),
        MarketInfo::new("BTC-PERPETUAL", MarketType::Future).with_base("BTC"),
        MarketInfo::new("ETH-PERPETUAL", MarketType::Future).with_base("ETH"),
        MarketInfo::new("BTC-27DEC24-50000-C", MarketType::Option).with_base("BTC"),
        MarketInfo::new("BTC-27DEC24-50000-P", MarketType::Option).with_base("BTC"),
    ]))
}

/// Short reconnect delay so failure scenarios finish quickly.
pub fn fast_config(venue: &str) -> StreamConfig {
    StreamConfig::new(venue).with_reconnect(Duration::from_millis(5), 3)
}

pub async fn started(config: StreamConfig, venue: &Arc<SimulatedVenue>) -> Collector {
    let collector = Collector::with_venue(config, Arc::clone(venue) as Arc<dyn Venue>);
    collector.start().await.expect("sim venue starts");
    collector
}
