use std::fs;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::{CryptoProvider, ring};
use tokio::time::sleep;

use deriv_book_collector::config::{Config, VenueConfig};
use deriv_book_collector::handler::StreamHandler;
use deriv_book_collector::metrics::METRICS;
use deriv_book_collector::sink::ForwardingSink;
use deriv_book_collector::{Collector, MultiVenueCollector, VenueRegistry};

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the rustls crypto backend
// - Load configuration
// - Create the forwarding sink (optional)
// - Start enabled venues and their subscriptions
// - Report metrics until Ctrl-C, then stop everything
//
// All supervisors share one thread and interleave at await points.
//
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // rustls >= 0.23 requires an explicit CryptoProvider,
    // installed once before the first TLS connection.
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    let config = load_config("config.json")?;
    let debug = config.debug.as_ref().and_then(|d| d.log).unwrap_or(false);

    let sink: Option<Arc<dyn StreamHandler>> = match &config.master {
        Some(master) => Some(Arc::new(ForwardingSink::new(master, debug)?)),
        None => None,
    };

    tokio::spawn(async {
        loop {
            sleep(Duration::from_secs(10)).await;
            log::info!("[METRICS] {}", METRICS.summary());
        }
    });

    let mut aggregator = MultiVenueCollector::new(VenueRegistry::builtin());

    for venue_cfg in config.venues.iter().filter(|v| v.enabled) {
        let mut stream = venue_cfg.stream.clone();
        if let Some(sink) = &sink {
            stream = stream.with_handler(Arc::clone(sink));
        }

        log::info!("starting {} collector", stream.venue);
        match aggregator.add_venue(stream).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::error!("failed to start {}: {e}", venue_cfg.stream.venue);
                continue;
            }
        }

        if let Some(collector) = aggregator.collector(&venue_cfg.stream.venue) {
            if let Err(e) = subscribe(collector, venue_cfg) {
                log::error!("subscription failed for {}: {e}", venue_cfg.stream.venue);
            }
        }
    }

    if aggregator.venues().is_empty() {
        anyhow::bail!("no venue could be started");
    }

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    aggregator.stop_all().await;

    Ok(())
}

/// Applies a venue entry's symbol lists and catalog-wide filters.
fn subscribe(collector: &Collector, cfg: &VenueConfig) -> anyhow::Result<()> {
    let mut total = collector.subscribe_futures(&cfg.futures)?;
    total += collector.subscribe_options(&cfg.options)?;

    if let Some(all) = &cfg.subscribe_all {
        let base = all.base_currency.as_deref();
        if all.futures {
            total += collector.subscribe_all_futures(base)?;
        }
        if all.options {
            total += collector.subscribe_all_options(base, all.option_right, all.expiry.as_deref())?;
        }
    }

    log::info!("{}: {} symbols subscribed", cfg.stream.venue, total);
    Ok(())
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// TODO:
// - Support CLI override (e.g. --config path)
//
fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)?;
    let cfg = serde_json::from_str(&data)?;
    Ok(cfg)
}
