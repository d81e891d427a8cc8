//! Pure capacity arithmetic: logical capacities, the concurrency margin and
//! the checkpoint-age thresholds derived from them.

use crate::log::lsn::LOG_BLOCK_SIZE;

/// Pages each concurrent thread may dirty between two free checks.
pub const PAGES_PER_THREAD: u64 = 4;
/// Background threads that append to the log without passing a free check.
pub const BACKGROUND_LOG_THREADS: u64 = 4;
/// Space held back for file-governor bookkeeping.
pub const LOG_FILES_GOVERNOR_SAFETY: u64 = 8 * LOG_BLOCK_SIZE;
/// Extra margin as a percentage of capacity.
pub const MARGIN_SAFETY_PCT: u64 = 5;
/// Largest share of capacity the margin may take.
pub const MARGIN_CAP_PCT: u64 = 50;
/// Percentage of the hard capacity usable before writers are throttled.
pub const SOFT_CAPACITY_PCT: u64 = 90;
/// Thread count assumed when concurrency is not limited.
pub const UNLIMITED_THREADS: u64 = 1000;

const fn align_block(value: u64) -> u64 {
    value - value % LOG_BLOCK_SIZE
}

/// Size of the concurrency margin for `log_capacity` bytes of soft capacity.
///
/// Returns the margin and whether it fits under the cap; a margin that would
/// exceed the cap is clamped to exactly the cap and reported unsafe.
pub fn concurrency_margin(log_capacity: u64, thread_concurrency: u64, page_size: u64) -> (u64, bool) {
    let threads = if thread_concurrency == 0 {
        UNLIMITED_THREADS
    } else {
        thread_concurrency
    };
    let per_thread = PAGES_PER_THREAD.saturating_mul(page_size);
    let margin = per_thread
        .saturating_mul(threads.saturating_add(BACKGROUND_LOG_THREADS))
        .saturating_add(LOG_FILES_GOVERNOR_SAFETY)
        .saturating_add(log_capacity / 100 * MARGIN_SAFETY_PCT);
    let cap = log_capacity / 100 * MARGIN_CAP_PCT;
    if margin > cap {
        (cap, false)
    } else {
        (margin, true)
    }
}

/// Log space writers may consume beyond the last checkpoint before they must
/// wait, block aligned.
///
/// # Panics
///
/// When `margin` is not below `soft_capacity`; callers derive the margin from
/// the same capacity, so this signals a logic error.
pub fn free_check_capacity(soft_capacity: u64, margin: u64) -> u64 {
    assert!(
        margin < soft_capacity,
        "concurrency margin {margin} must be below soft capacity {soft_capacity}"
    );
    align_block(soft_capacity - margin)
}

/// Logical capacities of a log of a given physical size.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct LogCapacity {
    /// Payload-addressable bytes across all files.
    pub physical: u64,
    /// Capacity the writer may never exceed; one file is held in reserve so
    /// the oldest file can be reclaimed while the newest is filled.
    pub hard_logical: u64,
    /// Capacity the checkpointer aims to stay within.
    pub soft_logical: u64,
}

impl LogCapacity {
    /// Capacities for `n_files` files holding `file_data_size` bytes each.
    pub fn new(n_files: u64, file_data_size: u64) -> Self {
        let physical = n_files.saturating_mul(file_data_size);
        let hard_logical = align_block(physical.saturating_sub(file_data_size));
        let soft_logical = align_block(hard_logical / 100 * SOFT_CAPACITY_PCT);
        Self {
            physical,
            hard_logical,
            soft_logical,
        }
    }

    /// Concurrency margin for this capacity.
    pub fn concurrency_margin(&self, thread_concurrency: u64, page_size: u64) -> (u64, bool) {
        concurrency_margin(self.soft_logical, thread_concurrency, page_size)
    }

    /// Free-check capacity for `margin`.
    pub fn free_check_capacity(&self, margin: u64) -> u64 {
        free_check_capacity(self.soft_logical, margin)
    }
}

/// Checkpoint-age thresholds that drive flushing and checkpointing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CheckpointAges {
    /// Age at which the checkpointer starts asking for page flushes.
    pub adaptive_flush_min_age: u64,
    /// Age at which those flushes become synchronous.
    pub adaptive_flush_max_age: u64,
    /// Age beyond which a checkpoint is written whenever it can advance.
    pub aggressive_checkpoint_min_age: u64,
}

impl CheckpointAges {
    /// Thresholds for a given free-check capacity.
    pub fn new(free_check_capacity: u64) -> Self {
        Self {
            adaptive_flush_min_age: align_block(free_check_capacity / 8 * 7),
            adaptive_flush_max_age: align_block(free_check_capacity / 16 * 15),
            aggressive_checkpoint_min_age: align_block(free_check_capacity / 32 * 31),
        }
    }
}
