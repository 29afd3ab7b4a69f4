//! Global atomic counters for batch evaluation.
//!
//! Counters are incremented at the call site. [`Metrics::flush`] emits
//! the current values as one `info!` event, e.g. from a periodic job.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    batches_started: AtomicU64,
    batches_failed: AtomicU64,
    items_evaluated: AtomicU64,
    items_failed: AtomicU64,
    item_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            batches_started: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            items_evaluated: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            item_retries: AtomicU64::new(0),
        }
    }

    /// Count a batch that started evaluating.
    pub fn inc_batches_started(&self) {
        self.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a batch that ended in failure.
    pub fn inc_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an item that finished successfully.
    pub fn inc_items_evaluated(&self) {
        self.items_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an item that failed after all attempts.
    pub fn inc_items_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one retry of an item.
    pub fn inc_item_retries(&self) {
        self.item_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            batches_started = self.batches_started(),
            batches_failed = self.batches_failed(),
            items_evaluated = self.items_evaluated(),
            items_failed = self.items_failed(),
            item_retries = self.item_retries(),
        );
    }

    /// Batches that started evaluating.
    pub fn batches_started(&self) -> u64 {
        self.batches_started.load(Ordering::Relaxed)
    }

    /// Batches that ended in failure.
    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    /// Items that finished successfully.
    pub fn items_evaluated(&self) -> u64 {
        self.items_evaluated.load(Ordering::Relaxed)
    }

    /// Items that failed after all attempts.
    pub fn items_failed(&self) -> u64 {
        self.items_failed.load(Ordering::Relaxed)
    }

    /// Retries across all items.
    pub fn item_retries(&self) -> u64 {
        self.item_retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        m.inc_batches_started();
        m.inc_items_evaluated();
        m.inc_items_evaluated();
        m.inc_items_failed();
        m.inc_item_retries();

        assert_eq!(m.batches_started(), 1);
        assert_eq!(m.batches_failed(), 0);
        assert_eq!(m.items_evaluated(), 2);
        assert_eq!(m.items_failed(), 1);
        assert_eq!(m.item_retries(), 1);
        m.flush();
    }
}
