use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::{Duration, sleep};

use crate::{
    handler::{self, StreamHandler},
    logging::LogContext,
    metrics::METRICS,
    schema::InstrumentKind,
    snapshot::OrderbookSnapshot,
    util,
    venue::{RawOrderbook, Venue},
};

use super::state::Shared;

/// Why a supervisor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The symbol left the subscription registry
    Unsubscribed,

    /// The owning collector stopped
    Stopped,

    /// Consecutive failures reached the configured maximum
    GaveUp { attempts: u32 },
}

/// Observable lifecycle of one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Streaming,
    Reconnecting { attempt: u32 },
    Terminated(ExitReason),
}

/// Decrements the active-supervisor gauge however the task ends,
/// including abort.
struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        METRICS.supervisors_active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        METRICS.supervisors_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Sole owner of the stream for one symbol.
///
/// Runs the pull loop:
/// - await next update from the venue
/// - build snapshot, store it, notify the handler
/// - on failure: notify, wait the flat reconnect delay, retry
///
/// GUARANTEES:
/// - Updates of the symbol are processed in venue delivery order
/// - Handler failures never end the loop
/// - Venue failures never escape; after `max_attempts` consecutive
///   failures the supervisor gives up and returns
///
/// The continue condition (collector running and own registration
/// still live) is checked at the top of every iteration and again
/// right before each snapshot is stored.
pub(crate) struct Supervisor {
    pub symbol: String,
    pub kind: InstrumentKind,
    pub ticket: u64,
    pub venue: Arc<dyn Venue>,
    pub venue_id: String,
    pub shared: Arc<Shared>,
    pub handler: Option<Arc<dyn StreamHandler>>,
    pub depth: usize,
    pub reconnect_delay: Duration,
    pub max_attempts: u32,
    pub log: LogContext,
}

impl Supervisor {
    fn transition(&self, next: SupervisorState) {
        self.shared.record_state(&self.symbol, self.ticket, next);
    }

    fn build_snapshot(&self, raw: RawOrderbook) -> OrderbookSnapshot {
        let snapshot = OrderbookSnapshot::new(
            self.symbol.clone(),
            util::timestamp_or_now(raw.timestamp_ms),
            raw.bids,
            raw.asks,
            self.venue_id.clone(),
        );

        if snapshot.is_well_ordered() {
            snapshot
        } else {
            self.log.warn(format_args!(
                "{}: venue delivered unsorted levels, reordering",
                self.symbol
            ));
            snapshot.into_well_ordered()
        }
    }

    /// Lets the venue drop the symbol's stream unless a newer
    /// subscription has taken it over meanwhile.
    async fn release_if_unwatched(&self) {
        let watched = self.shared.state.read().subscriptions.contains(&self.symbol);
        if watched {
            return;
        }

        if let Err(e) = self.venue.release(&self.symbol).await {
            self.log.warn(format_args!("failed to release {}: {}", self.symbol, e));
        }
    }

    pub async fn run(self) -> ExitReason {
        let _active = ActiveGuard::enter();
        let mut attempts: u32 = 0;

        self.transition(SupervisorState::Streaming);
        self.log.debug(format_args!("{} {} stream started", self.kind, self.symbol));

        let reason = loop {
            if let Some(reason) = self.shared.exit_reason(&self.symbol, self.ticket) {
                break reason;
            }

            match self.venue.watch_order_book(&self.symbol, self.depth).await {
                Ok(raw) => {
                    if attempts > 0 {
                        self.log.info(format_args!(
                            "{} recovered after {} failed attempt(s)",
                            self.symbol, attempts
                        ));
                    }
                    attempts = 0;

                    let snapshot = Arc::new(self.build_snapshot(raw));

                    // Unwanted by now: the loop check above names the reason
                    if !self.shared.commit(self.ticket, &snapshot) {
                        continue;
                    }
                    METRICS.updates_received.fetch_add(1, Ordering::Relaxed);

                    if let Some(h) = &self.handler {
                        handler::deliver_update(h.as_ref(), &snapshot, &self.log).await;
                    }
                }

                Err(e) => {
                    attempts += 1;
                    METRICS.stream_errors.fetch_add(1, Ordering::Relaxed);
                    self.log.warn(format_args!(
                        "error streaming {} (attempt {}/{}): {}",
                        self.symbol, attempts, self.max_attempts, e
                    ));
                    self.transition(SupervisorState::Reconnecting { attempt: attempts });

                    if let Some(h) = &self.handler {
                        handler::deliver_error(h.as_ref(), &self.symbol, &e, &self.log).await;
                    }

                    if attempts >= self.max_attempts {
                        METRICS.give_ups.fetch_add(1, Ordering::Relaxed);
                        self.log.error(format_args!(
                            "max reconnect attempts reached for {}, giving up",
                            self.symbol
                        ));
                        break ExitReason::GaveUp { attempts };
                    }

                    METRICS.reconnects.fetch_add(1, Ordering::Relaxed);
                    sleep(self.reconnect_delay).await;
                    self.transition(SupervisorState::Streaming);
                }
            }
        };

        if reason == ExitReason::Unsubscribed {
            self.release_if_unwatched().await;
        }

        self.transition(SupervisorState::Terminated(reason));
        self.log.debug(format_args!("{} stream ended: {:?}", self.symbol, reason));
        reason
    }
}
