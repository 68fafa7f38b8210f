use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const TARGET: &str = "deriv_book_collector";

/// Logging handle owned by one component.
///
/// Created when a collector is constructed and cloned into every
/// stream supervisor it spawns. Lines are prefixed with the label
/// (the venue id). After `release()` only errors still get through,
/// so late supervisor output after a stop stays quiet.
///
/// The process-wide logger backend is configured by the binary;
/// this handle only routes through the `log` facade.
#[derive(Clone)]
pub struct LogContext {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    released: AtomicBool,
}

impl LogContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Ends the handle's lifecycle. Idempotent.
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::AcqRel) {
            log::debug!(target: TARGET, "[{}] log context released", self.inner.label);
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if !self.is_released() {
            log::debug!(target: TARGET, "[{}] {}", self.inner.label, args);
        }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if !self.is_released() {
            log::info!(target: TARGET, "[{}] {}", self.inner.label, args);
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if !self.is_released() {
            log::warn!(target: TARGET, "[{}] {}", self.inner.label, args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        log::error!(target: TARGET, "[{}] {}", self.inner.label, args);
    }
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogContext")
            .field("label", &self.inner.label)
            .field("released", &self.is_released())
            .finish()
    }
}
