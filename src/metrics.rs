use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Process-wide runtime counters.
///
/// Purpose:
/// - Track active venues and stream supervisors
/// - Track throughput (updates in, records forwarded)
/// - Track failure handling (stream errors, reconnects, give-ups)
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update from any task
#[derive(Default)]
pub struct RuntimeMetrics {
    pub venues_active: AtomicUsize,
    pub supervisors_active: AtomicUsize,

    pub updates_received: AtomicUsize,
    pub callback_errors: AtomicUsize,

    pub stream_errors: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub give_ups: AtomicUsize,

    pub records_forwarded: AtomicUsize,
    pub records_dropped: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        let g = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "venues={} supervisors={} updates={} cb_err={} stream_err={} reconnects={} give_ups={} fwd={} dropped={}",
            g(&self.venues_active),
            g(&self.supervisors_active),
            g(&self.updates_received),
            g(&self.callback_errors),
            g(&self.stream_errors),
            g(&self.reconnects),
            g(&self.give_ups),
            g(&self.records_forwarded),
            g(&self.records_dropped),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
