//! Background thread deciding when to flush pages and write checkpoints.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::log::sys::LogSys;
use crate::types::Result;

/// State guarded by `checkpointer_mutex`.
pub(crate) struct CheckpointerState {
    last_checkpoint_time: Instant,
    last_activity: u64,
    last_generation: u64,
}

impl CheckpointerState {
    pub(crate) fn new(activity: u64) -> Self {
        Self {
            last_checkpoint_time: Instant::now(),
            last_activity: activity,
            last_generation: 0,
        }
    }
}

pub(crate) fn spawn_checkpointer(log: &Arc<LogSys>) -> Result<JoinHandle<()>> {
    let log = Arc::clone(log);
    let handle = thread::Builder::new()
        .name("log-checkpointer".to_owned())
        .spawn(move || checkpointer_loop(&log))?;
    Ok(handle)
}

fn checkpointer_loop(log: &LogSys) {
    debug!("log.checkpointer.start");
    let timeout = log.options().checkpointer_timeout;
    loop {
        let seen = log.checkpointer_event.generation();
        if log.is_shutting_down() {
            break;
        }
        if let Err(err) = log.checkpointer_tick(seen) {
            warn!(error = %err, "log.checkpointer.tick_failed");
        }
        log.checkpointer_event.wait_past(seen, timeout);
    }
    log.checkpointer_shutdown();
    debug!("log.checkpointer.exit");
}

impl LogSys {
    /// One evaluation of the checkpointer. `generation` is the checkpointer
    /// event generation observed before the call; a change since the previous
    /// tick means somebody explicitly asked for attention.
    fn checkpointer_tick(&self, generation: u64) -> Result<()> {
        let mut state = self.checkpointer_mutex.lock();
        let signalled = generation != state.last_generation;
        state.last_generation = generation;
        let activity = self.collab.activity.get();
        let busy = activity != state.last_activity;
        state.last_activity = activity;
        let periodic_due = self.periodic_checkpoints.load(Ordering::Acquire)
            && state.last_checkpoint_time.elapsed() >= self.options().checkpoint_every;
        let age = self.current_lsn().saturating_since(self.last_checkpoint_lsn());
        if busy
            && !signalled
            && !periodic_due
            && age < self.checkpoint_ages().adaptive_flush_min_age
        {
            return Ok(());
        }

        self.write_up_to(self.current_lsn(), true)?;
        self.request_page_flushes();
        self.compute_available_for_checkpoint_lsn();
        if self.checkpoint_decision(periodic_due).decide().is_none() {
            return Ok(());
        }

        drop(state);
        self.collab.dict.persist_pending_metadata()?;
        let mut state = self.checkpointer_mutex.lock();

        self.compute_available_for_checkpoint_lsn();
        let decision = self.checkpoint_decision(periodic_due);
        let Some(reason) = decision.decide() else {
            return Ok(());
        };
        debug!(
            ?reason,
            target = decision.target.0,
            last = decision.last.0,
            "log.checkpointer.decide"
        );
        match self.write_checkpoint(decision.target) {
            Ok(()) => {
                state.last_checkpoint_time = Instant::now();
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, target = decision.target.0, "log.checkpointer.write_failed");
                Err(err)
            }
        }
    }

    /// Asks the buffer pool to flush pages holding back a requested checkpoint
    /// and, once the checkpoint age passes the adaptive threshold, pages older
    /// than that age. Past the max age the flush is forced.
    fn request_page_flushes(&self) {
        let pool = &self.collab.buffer_pool;
        let last = self.last_checkpoint_lsn();
        let requested = self.limits.requested_checkpoint_lsn();
        if requested > last {
            self.metrics().flush_requested(true);
            pool.flush_up_to(requested, true);
        }
        let current = self.current_lsn();
        let age = current.saturating_since(last);
        let ages = self.checkpoint_ages();
        if age >= ages.adaptive_flush_min_age {
            let forced = age >= ages.adaptive_flush_max_age;
            let target = current - ages.adaptive_flush_min_age;
            debug!(age, forced, target = target.0, "log.checkpointer.adaptive_flush");
            self.metrics().flush_requested(forced);
            pool.flush_up_to(target, forced);
        }
    }

    /// Waits for in-flight writes to drain, then attempts a last checkpoint.
    fn checkpointer_shutdown(&self) {
        if let Err(err) = self.wait_for_quiescence(self.options().wait_alert_every) {
            warn!(error = %err, "log.checkpointer.quiesce_failed");
            return;
        }
        let _state = self.checkpointer_mutex.lock();
        if !self.checkpoints_enabled() || self.checkpoints_disabled_for_test.load(Ordering::Acquire) {
            return;
        }
        self.compute_available_for_checkpoint_lsn();
        let target = self.checkpoint_target();
        if target <= self.last_checkpoint_lsn() {
            return;
        }
        match self.write_checkpoint(target) {
            Ok(()) => info!(lsn = target.0, "log.checkpointer.final_checkpoint"),
            Err(err) => warn!(error = %err, "log.checkpointer.final_checkpoint_failed"),
        }
    }
}
