use std::sync::atomic::{AtomicU64, Ordering};

/// Hooks for observing checkpoint, free-check and archiver activity.
pub trait LogMetrics: Send + Sync {
    /// A checkpoint header was written and synced.
    fn checkpoint_written(&self, lsn: u64);
    /// A checkpoint write failed and will be retried.
    fn checkpoint_failed(&self);
    /// A caller waited in the free check.
    fn free_check_waited(&self, micros: u64);
    /// The checkpointer asked the buffer pool for a flush.
    fn flush_requested(&self, forced: bool);
    /// The archiver copied `bytes` bytes.
    fn archived(&self, bytes: u64);
    /// An archiver copy failed.
    fn archive_failed(&self);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl LogMetrics for NoopMetrics {
    fn checkpoint_written(&self, _lsn: u64) {}
    fn checkpoint_failed(&self) {}
    fn free_check_waited(&self, _micros: u64) {}
    fn flush_requested(&self, _forced: bool) {}
    fn archived(&self, _bytes: u64) {}
    fn archive_failed(&self) {}
}

/// Atomic counters for every event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Checkpoints written.
    pub checkpoints: AtomicU64,
    /// Lsn of the most recent checkpoint.
    pub last_checkpoint_lsn: AtomicU64,
    /// Failed checkpoint writes.
    pub checkpoint_failures: AtomicU64,
    /// Free checks that had to wait.
    pub free_check_waits: AtomicU64,
    /// Total microseconds spent waiting in free checks.
    pub free_check_wait_micros: AtomicU64,
    /// Best-effort flush requests.
    pub flush_requests: AtomicU64,
    /// Synchronous flush requests.
    pub sync_flush_requests: AtomicU64,
    /// Bytes copied by the archiver.
    pub archived_bytes: AtomicU64,
    /// Failed archiver copies.
    pub archive_failures: AtomicU64,
}

impl LogMetrics for CounterMetrics {
    fn checkpoint_written(&self, lsn: u64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.last_checkpoint_lsn.fetch_max(lsn, Ordering::Relaxed);
    }

    fn checkpoint_failed(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn free_check_waited(&self, micros: u64) {
        self.free_check_waits.fetch_add(1, Ordering::Relaxed);
        self.free_check_wait_micros
            .fetch_add(micros, Ordering::Relaxed);
    }

    fn flush_requested(&self, forced: bool) {
        if forced {
            self.sync_flush_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flush_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn archived(&self, bytes: u64) {
        self.archived_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn archive_failed(&self) {
        self.archive_failures.fetch_add(1, Ordering::Relaxed);
    }
}
