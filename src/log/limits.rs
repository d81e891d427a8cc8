//! Checkpoint-affecting limits guarded by `limits_mutex`.
//!
//! This mutex is the innermost lock of the log: it may be taken while holding
//! the writer or file-set locks, never the other way round, and it is never
//! held across I/O or a wait.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::log::capacity::LogCapacity;
use crate::log::lsn::lsn_to_sn;
use crate::types::{Lsn, Sn};

/// Point-in-time copy of the limits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct LimitsSnapshot {
    /// Highest lsn known to be safe for a checkpoint.
    pub available_for_checkpoint_lsn: u64,
    /// Highest lsn any caller asked to have checkpointed.
    pub requested_checkpoint_lsn: u64,
    /// Ceiling imposed by dictionary metadata, 0 when none.
    pub dict_max_allowed_checkpoint_lsn: u64,
    /// Log space reserved for concurrent writers.
    pub concurrency_margin: u64,
    /// False when the margin had to be clamped.
    pub concurrency_margin_is_safe: bool,
    /// Writers at or below this sn pass the free check without waiting.
    pub free_check_limit_sn: u64,
}

#[derive(Default)]
struct LimitsState {
    snapshot: LimitsSnapshot,
    warned_unsafe: bool,
}

/// Limits tracker.
#[derive(Default)]
pub(crate) struct Limits {
    state: Mutex<LimitsState>,
    /// Mirror of `free_check_limit_sn` for the lock-free fast path.
    free_check_limit_sn: AtomicU64,
}

impl Limits {
    pub(crate) fn new(initial_available: Lsn) -> Self {
        let limits = Self::default();
        limits.state.lock().snapshot.available_for_checkpoint_lsn = initial_available.0;
        limits
    }

    pub(crate) fn snapshot(&self) -> LimitsSnapshot {
        self.state.lock().snapshot
    }

    pub(crate) fn free_check_limit_sn(&self) -> Sn {
        Sn(self.free_check_limit_sn.load(Ordering::Acquire))
    }

    pub(crate) fn available_for_checkpoint_lsn(&self) -> Lsn {
        Lsn(self.state.lock().snapshot.available_for_checkpoint_lsn)
    }

    pub(crate) fn concurrency_margin(&self) -> u64 {
        self.state.lock().snapshot.concurrency_margin
    }

    /// Raises the available lsn to `candidate`; ignored while checkpoints are
    /// not yet enabled. Returns the stored value.
    pub(crate) fn update_available_for_checkpoint(&self, candidate: Lsn, enabled: bool) -> Lsn {
        let mut state = self.state.lock();
        if enabled && candidate.0 > state.snapshot.available_for_checkpoint_lsn {
            state.snapshot.available_for_checkpoint_lsn = candidate.0;
        }
        Lsn(state.snapshot.available_for_checkpoint_lsn)
    }

    /// Raises the requested lsn. Returns true when the checkpointer must be
    /// woken because the request is ahead of `last_checkpoint`.
    pub(crate) fn request_checkpoint(&self, lsn: Lsn, last_checkpoint: Lsn) -> bool {
        let mut state = self.state.lock();
        if lsn.0 > state.snapshot.requested_checkpoint_lsn {
            state.snapshot.requested_checkpoint_lsn = lsn.0;
        }
        let wake = state.snapshot.requested_checkpoint_lsn > last_checkpoint.0;
        if wake {
            debug!(
                requested = state.snapshot.requested_checkpoint_lsn,
                last_checkpoint = last_checkpoint.0,
                "log.limits.request_checkpoint"
            );
        }
        wake
    }

    pub(crate) fn set_dict_max_allowed_checkpoint_lsn(&self, lsn: Lsn) {
        self.state.lock().snapshot.dict_max_allowed_checkpoint_lsn = lsn.0;
    }

    pub(crate) fn dict_max_allowed_checkpoint_lsn(&self) -> Lsn {
        Lsn(self.state.lock().snapshot.dict_max_allowed_checkpoint_lsn)
    }

    pub(crate) fn requested_checkpoint_lsn(&self) -> Lsn {
        Lsn(self.state.lock().snapshot.requested_checkpoint_lsn)
    }

    /// Recomputes the concurrency margin. The first time it turns out unsafe
    /// a warning is logged.
    pub(crate) fn update_concurrency_margin(
        &self,
        capacity: &LogCapacity,
        thread_concurrency: u64,
        page_size: u64,
    ) -> (u64, bool) {
        let (margin, is_safe) = capacity.concurrency_margin(thread_concurrency, page_size);
        let mut state = self.state.lock();
        state.snapshot.concurrency_margin = margin;
        state.snapshot.concurrency_margin_is_safe = is_safe;
        if !is_safe && !state.warned_unsafe {
            state.warned_unsafe = true;
            warn!(
                margin,
                soft_capacity = capacity.soft_logical,
                thread_concurrency,
                "log.limits.margin_unsafe: concurrency margin clamped; \
                 free-space deadlock avoidance is not guaranteed with these settings"
            );
        } else if is_safe {
            state.warned_unsafe = false;
        }
        (margin, is_safe)
    }

    /// Moves the free-check limit. While the writer is inside the extra margin
    /// the limit is pinned to zero; otherwise it only grows.
    pub(crate) fn update_free_check_limit(
        &self,
        in_extra_margin: bool,
        last_checkpoint: Lsn,
        free_check_capacity: u64,
    ) -> Sn {
        let mut state = self.state.lock();
        let limit = if in_extra_margin {
            0
        } else {
            let computed = lsn_to_sn(last_checkpoint + free_check_capacity).0;
            computed.max(state.snapshot.free_check_limit_sn)
        };
        state.snapshot.free_check_limit_sn = limit;
        self.free_check_limit_sn.store(limit, Ordering::Release);
        Sn(limit)
    }
}
