//! Collaborators the log depends on but does not own: the buffer pool,
//! dictionary persistence and the server activity counter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{Lsn, Result};

/// View of the buffer pool needed to compute checkpoints.
pub trait BufferPool: Send + Sync {
    /// Highest lsn up to which every dirty page has been registered.
    fn dirty_pages_added_up_to_lsn(&self) -> Lsn;
    /// Smallest oldest-modification lsn over dirty pages, 0 if none.
    fn oldest_modification_lwm(&self) -> Lsn;
    /// Asks the flusher to write pages modified before `lsn`.
    fn flush_up_to(&self, lsn: Lsn, forced: bool);
    /// Writes every dirty page before returning.
    fn sync_flush_all(&self);
    /// Registers `pages` as modified by the record starting at `lsn`.
    fn register_dirty_pages(&self, pages: &[u64], lsn: Lsn);
    /// Advances the registration watermark to `lsn`.
    fn mark_added_up_to(&self, lsn: Lsn);
}

/// Persists dictionary metadata that must be durable before a checkpoint.
pub trait DictPersistence: Send + Sync {
    /// Writes pending metadata changes to their durable buffer.
    fn persist_pending_metadata(&self) -> Result<()>;
}

/// Dictionary persistence with nothing to persist.
#[derive(Debug, Default)]
pub struct NoopDictPersistence;

impl DictPersistence for NoopDictPersistence {
    fn persist_pending_metadata(&self) -> Result<()> {
        Ok(())
    }
}

/// Counter bumped by user activity; the checkpointer skips evaluation while it
/// keeps moving.
#[derive(Debug, Default)]
pub struct ActivityCounter(AtomicU64);

impl ActivityCounter {
    /// Records one unit of activity.
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Current count.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct DirtyPages {
    by_page: HashMap<u64, Lsn>,
    by_lsn: BTreeMap<Lsn, usize>,
}

impl DirtyPages {
    fn remove_page(&mut self, page: u64) {
        if let Some(lsn) = self.by_page.remove(&page) {
            if let Some(count) = self.by_lsn.get_mut(&lsn) {
                *count -= 1;
                if *count == 0 {
                    self.by_lsn.remove(&lsn);
                }
            }
        }
    }
}

/// In-memory dirty page registry implementing [`BufferPool`].
///
/// Pages are identified by number and carry the lsn of their oldest
/// unflushed modification. Flush requests clean pages immediately unless
/// flushing has been paused, which lets callers model a stalled flusher.
#[derive(Default)]
pub struct DirtyPageTracker {
    pages: Mutex<DirtyPages>,
    added_up_to: AtomicU64,
    paused: AtomicBool,
    flush_requests: AtomicU64,
}

impl DirtyPageTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `page` dirty as of `lsn`; an already dirty page keeps its older lsn.
    pub fn add_dirty_page(&self, page: u64, lsn: Lsn) {
        let mut pages = self.pages.lock();
        if pages.by_page.contains_key(&page) {
            return;
        }
        pages.by_page.insert(page, lsn);
        *pages.by_lsn.entry(lsn).or_insert(0) += 1;
    }

    /// Advances the registration watermark.
    pub fn note_added_up_to(&self, lsn: Lsn) {
        self.added_up_to.fetch_max(lsn.0, Ordering::AcqRel);
    }

    /// Number of dirty pages.
    pub fn dirty_count(&self) -> usize {
        self.pages.lock().by_page.len()
    }

    /// Stops (or resumes) cleaning pages on flush requests.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Flush requests received so far.
    pub fn flush_requests(&self) -> u64 {
        self.flush_requests.load(Ordering::Relaxed)
    }

    /// Cleans every page whose oldest modification is below `lsn`.
    pub fn clean_up_to(&self, lsn: Lsn) -> usize {
        let mut pages = self.pages.lock();
        let victims: Vec<u64> = pages
            .by_page
            .iter()
            .filter(|(_, oldest)| **oldest < lsn)
            .map(|(page, _)| *page)
            .collect();
        for page in &victims {
            pages.remove_page(*page);
        }
        victims.len()
    }
}

impl BufferPool for DirtyPageTracker {
    fn dirty_pages_added_up_to_lsn(&self) -> Lsn {
        Lsn(self.added_up_to.load(Ordering::Acquire))
    }

    fn oldest_modification_lwm(&self) -> Lsn {
        self.pages
            .lock()
            .by_lsn
            .keys()
            .next()
            .copied()
            .unwrap_or(Lsn::ZERO)
    }

    fn flush_up_to(&self, lsn: Lsn, forced: bool) {
        self.flush_requests.fetch_add(1, Ordering::Relaxed);
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let cleaned = self.clean_up_to(lsn);
        debug!(lsn = lsn.0, forced, cleaned, "bufpool.flush_up_to");
    }

    fn sync_flush_all(&self) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let mut pages = self.pages.lock();
        pages.by_page.clear();
        pages.by_lsn.clear();
    }

    fn register_dirty_pages(&self, pages: &[u64], lsn: Lsn) {
        for page in pages {
            self.add_dirty_page(*page, lsn);
        }
    }

    fn mark_added_up_to(&self, lsn: Lsn) {
        self.note_added_up_to(lsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lwm_tracks_oldest_dirty_page() {
        let pool = DirtyPageTracker::new();
        assert_eq!(pool.oldest_modification_lwm(), Lsn::ZERO);
        pool.add_dirty_page(1, Lsn(9000));
        pool.add_dirty_page(2, Lsn(8500));
        pool.add_dirty_page(1, Lsn(9500));
        assert_eq!(pool.oldest_modification_lwm(), Lsn(8500));
        pool.flush_up_to(Lsn(8600), false);
        assert_eq!(pool.oldest_modification_lwm(), Lsn(9000));
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn paused_tracker_ignores_flushes() {
        let pool = DirtyPageTracker::new();
        pool.add_dirty_page(1, Lsn(9000));
        pool.set_paused(true);
        pool.flush_up_to(Lsn(10_000), true);
        pool.sync_flush_all();
        assert_eq!(pool.dirty_count(), 1);
        assert_eq!(pool.flush_requests(), 1);
        pool.set_paused(false);
        pool.sync_flush_all();
        assert_eq!(pool.dirty_count(), 0);
    }

    #[test]
    fn watermark_is_monotonic() {
        let pool = DirtyPageTracker::new();
        pool.note_added_up_to(Lsn(9000));
        pool.note_added_up_to(Lsn(8000));
        assert_eq!(pool.dirty_pages_added_up_to_lsn(), Lsn(9000));
    }
}
