//! Gate that throttles writers while the log lacks free space.

use tracing::{debug, trace};

use crate::log::sys::LogSys;
use crate::primitives::concurrency::{poll_until, Poll, WaitStats};
use crate::types::{Lsn, Result};

/// Polls before the first sleep; a checkpoint often lands within a few.
const FREE_CHECK_SPINS: u32 = 64;

impl LogSys {
    /// Blocks until the log has room for another mini-transaction.
    ///
    /// The fast path compares the current sn with the free-check limit and
    /// takes no lock. Otherwise a checkpoint is requested far enough ahead to
    /// free `free_check_capacity` bytes and the caller polls until the limit
    /// passes the sn it observed on entry.
    ///
    /// Must be called while holding no page latches, otherwise the flush the
    /// checkpoint waits for may never complete. The wait is not cancellable;
    /// it ends with [`crate::LogError::Interrupted`] only once shutdown began.
    pub fn free_check(&self) -> Result<WaitStats> {
        let sn = self.current_sn();
        if sn <= self.limits.free_check_limit_sn() {
            return Ok(WaitStats::default());
        }
        let current = self.current_lsn();
        let target = Lsn(current.0.saturating_sub(self.free_check_capacity()));
        if self.limits.request_checkpoint(target, self.last_checkpoint_lsn()) {
            self.checkpointer_event.notify();
        }
        debug!(
            sn = sn.0,
            limit = self.limits.free_check_limit_sn().0,
            target = target.0,
            "log.free_check.wait"
        );
        let stats = poll_until(
            &self.wait_options("free log space").with_spins(FREE_CHECK_SPINS),
            Some(&self.checkpoint_done),
            || {
                if sn <= self.limits.free_check_limit_sn() {
                    Poll::Ready
                } else if self.is_shutting_down() {
                    Poll::Interrupted
                } else {
                    Poll::Pending
                }
            },
        )?;
        let micros = stats.waited.as_micros() as u64;
        self.metrics().free_check_waited(micros);
        trace!(micros, rounds = stats.rounds, "log.free_check.done");
        Ok(stats)
    }
}
