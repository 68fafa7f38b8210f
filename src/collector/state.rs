use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::schema::InstrumentKind;
use crate::snapshot::OrderbookSnapshot;

use super::supervisor::{ExitReason, SupervisorState};

// ------------------------------------------------------------
// Subscription registry
// ------------------------------------------------------------
//
// Two disjoint symbol sets. Each entry carries the ticket of the
// supervisor spawned for it; a supervisor keeps running only while
// its own ticket is registered, so a re-subscribe after an
// unsubscribe never leaves two supervisors on one symbol.
//
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    futures: HashMap<String, u64>,
    options: HashMap<String, u64>,
    next_ticket: u64,
}

impl Subscriptions {
    fn set(&self, kind: InstrumentKind) -> &HashMap<String, u64> {
        match kind {
            InstrumentKind::Future => &self.futures,
            InstrumentKind::Option => &self.options,
        }
    }

    /// Registers `symbol` and returns a fresh ticket, or `None`
    /// when the symbol is already registered under either kind.
    pub fn insert(&mut self, symbol: &str, kind: InstrumentKind) -> Option<u64> {
        if self.contains(symbol) {
            return None;
        }
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let set = match kind {
            InstrumentKind::Future => &mut self.futures,
            InstrumentKind::Option => &mut self.options,
        };
        set.insert(symbol.to_string(), ticket);
        Some(ticket)
    }

    pub fn clear(&mut self) {
        self.futures.clear();
        self.options.clear();
    }

    /// Removes `symbol` from both sets.
    pub fn remove(&mut self, symbol: &str) -> bool {
        let f = self.futures.remove(symbol).is_some();
        let o = self.options.remove(symbol).is_some();
        f || o
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.futures.contains_key(symbol) || self.options.contains_key(symbol)
    }

    pub fn contains_kind(&self, symbol: &str, kind: InstrumentKind) -> bool {
        self.set(kind).contains_key(symbol)
    }

    /// True while `ticket` is the live registration of `symbol`.
    pub fn holds(&self, symbol: &str, ticket: u64) -> bool {
        self.futures.get(symbol) == Some(&ticket) || self.options.get(symbol) == Some(&ticket)
    }

    /// Symbols of one kind, sorted.
    pub fn symbols(&self, kind: InstrumentKind) -> Vec<String> {
        let mut out: Vec<String> = self.set(kind).keys().cloned().collect();
        out.sort_unstable();
        out
    }
}

// ------------------------------------------------------------
// Snapshot history
// ------------------------------------------------------------
//
// Per-symbol sliding window. Appending beyond `max` drops the
// oldest entry in O(1).
//
#[derive(Debug)]
pub(crate) struct SnapshotHistory {
    max: usize,
    per_symbol: HashMap<String, VecDeque<Arc<OrderbookSnapshot>>>,
}

impl SnapshotHistory {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            per_symbol: HashMap::new(),
        }
    }

    pub fn push(&mut self, snapshot: Arc<OrderbookSnapshot>) {
        if self.max == 0 {
            return;
        }
        let max = self.max;
        let window = self
            .per_symbol
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(max.min(1024)));

        window.push_back(snapshot);
        while window.len() > max {
            window.pop_front();
        }
    }

    /// Oldest first. `Some(n)` keeps only the most recent `n`.
    pub fn get(&self, symbol: &str, limit: Option<usize>) -> Vec<Arc<OrderbookSnapshot>> {
        let Some(window) = self.per_symbol.get(symbol) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |n| window.len().saturating_sub(n));
        window.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.per_symbol.get(symbol).map_or(0, VecDeque::len)
    }
}

// ------------------------------------------------------------
// Shared collector state
// ------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct BookState {
    pub subscriptions: Subscriptions,
    pub orderbooks: HashMap<String, Arc<OrderbookSnapshot>>,
    pub history: SnapshotHistory,

    /// Latest supervisor state per symbol, tagged with its ticket
    pub supervisors: HashMap<String, (u64, SupervisorState)>,
}

/// State shared between a collector and its supervisors.
///
/// One lock guards the registry, cache and history together, so
/// "is this symbol still wanted -> store its snapshot" is a single
/// critical section with no suspension point inside.
#[derive(Debug)]
pub(crate) struct Shared {
    running: AtomicBool,
    store_snapshots: bool,
    pub state: RwLock<BookState>,
}

impl Shared {
    pub fn new(store_snapshots: bool, max_snapshots_per_symbol: usize) -> Self {
        Self {
            running: AtomicBool::new(false),
            store_snapshots,
            state: RwLock::new(BookState {
                subscriptions: Subscriptions::default(),
                orderbooks: HashMap::new(),
                history: SnapshotHistory::new(max_snapshots_per_symbol),
                supervisors: HashMap::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::AcqRel)
    }

    /// Why the supervisor holding `ticket` must stop, if it must.
    pub fn exit_reason(&self, symbol: &str, ticket: u64) -> Option<ExitReason> {
        if !self.is_running() {
            return Some(ExitReason::Stopped);
        }
        if !self.state.read().subscriptions.holds(symbol, ticket) {
            return Some(ExitReason::Unsubscribed);
        }
        None
    }

    /// Writes `snapshot` into the cache and history if the
    /// supervisor holding `ticket` is still wanted.
    pub fn commit(&self, ticket: u64, snapshot: &Arc<OrderbookSnapshot>) -> bool {
        let mut state = self.state.write();
        if !self.is_running() || !state.subscriptions.holds(&snapshot.symbol, ticket) {
            return false;
        }

        state
            .orderbooks
            .insert(snapshot.symbol.clone(), Arc::clone(snapshot));
        if self.store_snapshots {
            state.history.push(Arc::clone(snapshot));
        }
        true
    }

    /// Records a supervisor transition unless a newer supervisor
    /// already owns the symbol.
    pub fn record_state(&self, symbol: &str, ticket: u64, next: SupervisorState) {
        record_in(&mut self.state.write(), symbol, ticket, next);
    }

    /// Marks the cancelled supervisors stopped and empties the
    /// registry, so a later start begins with no subscriptions.
    pub fn finish_stop(&self, cancelled: &[(String, u64)]) {
        let mut state = self.state.write();
        for (symbol, ticket) in cancelled {
            record_in(
                &mut state,
                symbol,
                *ticket,
                SupervisorState::Terminated(ExitReason::Stopped),
            );
        }
        state.subscriptions.clear();
    }
}

fn record_in(state: &mut BookState, symbol: &str, ticket: u64, next: SupervisorState) {
    let supervisors = &mut state.supervisors;
    match supervisors.get_mut(symbol) {
        Some((owner, current)) if *owner <= ticket => {
            *owner = ticket;
            *current = next;
        }
        Some(_) => {}
        None => {
            supervisors.insert(symbol.to_string(), (ticket, next));
        }
    }
}
