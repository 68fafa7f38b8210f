use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{MarketInfo, Markets, RawOrderbook, Venue, VenueError};

/// Scripted event for one symbol's feed.
#[derive(Debug, Clone)]
pub enum SimEvent {
    Book(RawOrderbook),
    Fail(String),
}

struct Feed {
    tx: mpsc::UnboundedSender<SimEvent>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<SimEvent>>>,
}

impl Feed {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }
}

/// In-memory venue driven by a script.
///
/// Each symbol has its own queue of events. `watch_order_book`
/// pops the next one, suspending while the queue is empty, which
/// is how a quiet market looks to the collector. Symbols marked
/// with `fail_always` fail every read immediately.
///
/// No network I/O; used by tests and local demos.
pub struct SimulatedVenue {
    id: String,
    markets: Mutex<Markets>,
    feeds: Mutex<HashMap<String, Feed>>,
    always_fail: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    closed: AtomicBool,
    watch_calls: Mutex<HashMap<String, usize>>,
    last_depth: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl SimulatedVenue {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            markets: Mutex::new(Markets::new()),
            feeds: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashSet::new()),
            unreachable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            watch_calls: Mutex::new(HashMap::new()),
            last_depth: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn with_markets(self, markets: impl IntoIterator<Item = MarketInfo>) -> Self {
        for m in markets {
            self.add_market(m);
        }
        self
    }

    pub fn add_market(&self, market: MarketInfo) {
        self.markets.lock().insert(market.symbol.clone(), market);
    }

    fn sender(&self, symbol: &str) -> mpsc::UnboundedSender<SimEvent> {
        self.feeds
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(Feed::new)
            .tx
            .clone()
    }

    /// Queues a book update for `symbol`.
    pub fn push_book(&self, symbol: &str, book: RawOrderbook) {
        let _ = self.sender(symbol).send(SimEvent::Book(book));
    }

    /// Queues one transient failure for `symbol`.
    pub fn push_failure(&self, symbol: &str, reason: impl Into<String>) {
        let _ = self.sender(symbol).send(SimEvent::Fail(reason.into()));
    }

    /// Every subsequent read of `symbol` fails until `recover`.
    pub fn fail_always(&self, symbol: &str) {
        self.always_fail.lock().insert(symbol.to_string());
    }

    pub fn recover(&self, symbol: &str) {
        self.always_fail.lock().remove(symbol);
    }

    /// Makes `load_markets` fail like an unreachable venue.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `watch_order_book` calls made for `symbol`.
    pub fn watch_calls(&self, symbol: &str) -> usize {
        self.watch_calls.lock().get(symbol).copied().unwrap_or(0)
    }

    /// Depth passed to the most recent `watch_order_book`.
    pub fn last_depth(&self) -> usize {
        self.last_depth.load(Ordering::SeqCst)
    }

    /// Symbols handed to `release`, in call order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

#[async_trait::async_trait]
impl Venue for SimulatedVenue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self) -> Result<Markets, VenueError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VenueError::Connect(format!("{} unreachable", self.id)));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(self.markets.lock().clone())
    }

    async fn watch_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> Result<RawOrderbook, VenueError> {
        *self.watch_calls.lock().entry(symbol.to_string()).or_default() += 1;
        self.last_depth.store(depth, Ordering::SeqCst);

        if self.is_closed() {
            return Err(VenueError::Closed);
        }

        let failing = self.always_fail.lock().contains(symbol);
        if failing {
            tokio::task::yield_now().await;
            return Err(VenueError::Disconnected(format!("{symbol} feed down")));
        }

        let rx = {
            let mut feeds = self.feeds.lock();
            feeds
                .entry(symbol.to_string())
                .or_insert_with(Feed::new)
                .rx
                .clone()
        };

        let event = rx.lock().await.recv().await;
        match event {
            Some(SimEvent::Book(mut book)) => {
                book.bids.truncate(depth);
                book.asks.truncate(depth);
                Ok(book)
            }
            Some(SimEvent::Fail(reason)) => Err(VenueError::Disconnected(reason)),
            None => Err(VenueError::Closed),
        }
    }

    async fn release(&self, symbol: &str) -> Result<(), VenueError> {
        self.released.lock().push(symbol.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), VenueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
