use std::sync::atomic::{AtomicU64, Ordering};

/// Counters the storage manager keeps for operators. Plain atomics; the
/// daemon logs them on shutdown and tests assert on them directly.
#[derive(Debug, Default)]
pub struct StorageManagerMetrics {
    pub start_time_ms: AtomicU64,
    pub shutdown_time_ms: AtomicU64,
    pub resume_decommission_error_count: AtomicU64,
    pub total_store_start_failures: AtomicU64,
}

impl StorageManagerMetrics {
    pub fn record_start_time_ms(&self, ms: u64) {
        self.start_time_ms.store(ms, Ordering::SeqCst);
    }

    pub fn record_shutdown_time_ms(&self, ms: u64) {
        self.shutdown_time_ms.store(ms, Ordering::SeqCst);
    }

    pub fn inc_resume_decommission_errors(&self) {
        self.resume_decommission_error_count
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_store_start_failures(&self) {
        self.total_store_start_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resume_decommission_errors(&self) -> u64 {
        self.resume_decommission_error_count.load(Ordering::SeqCst)
    }

    pub fn store_start_failures(&self) -> u64 {
        self.total_store_start_failures.load(Ordering::SeqCst)
    }
}
