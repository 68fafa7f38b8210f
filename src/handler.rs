use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;

use futures_util::FutureExt;

use crate::logging::LogContext;
use crate::metrics::METRICS;
use crate::snapshot::OrderbookSnapshot;
use crate::venue::VenueError;

/// Consumer callbacks invoked by the stream supervisors.
///
/// Both operations may suspend. Errors and panics raised inside them
/// are caught, logged and counted; they never stop the stream that
/// invoked them.
///
/// Persistence sinks register through this trait as well: they get
/// snapshots in delivery order per symbol and own their buffering.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync {
    /// Called once per processed book update.
    async fn on_orderbook_update(&self, snapshot: &OrderbookSnapshot) -> anyhow::Result<()> {
        let _ = snapshot;
        Ok(())
    }

    /// Called once per transient stream failure, before the retry decision.
    async fn on_error(&self, symbol: &str, error: &VenueError) -> anyhow::Result<()> {
        let _ = (symbol, error);
        Ok(())
    }
}

/// Runs `on_orderbook_update`, isolating failures.
pub(crate) async fn deliver_update(
    handler: &dyn StreamHandler,
    snapshot: &OrderbookSnapshot,
    log: &LogContext,
) {
    let outcome = AssertUnwindSafe(handler.on_orderbook_update(snapshot))
        .catch_unwind()
        .await;
    report(outcome, "orderbook", &snapshot.symbol, log);
}

/// Runs `on_error`, isolating failures.
pub(crate) async fn deliver_error(
    handler: &dyn StreamHandler,
    symbol: &str,
    error: &VenueError,
    log: &LogContext,
) {
    let outcome = AssertUnwindSafe(handler.on_error(symbol, error))
        .catch_unwind()
        .await;
    report(outcome, "error", symbol, log);
}

fn report(
    outcome: std::thread::Result<anyhow::Result<()>>,
    callback: &str,
    symbol: &str,
    log: &LogContext,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            METRICS.callback_errors.fetch_add(1, Ordering::Relaxed);
            log.error(format_args!("{callback} callback failed for {symbol}: {e:#}"));
        }
        Err(_) => {
            METRICS.callback_errors.fetch_add(1, Ordering::Relaxed);
            log.error(format_args!("{callback} callback panicked for {symbol}"));
        }
    }
}
