//! Checkpoint lsn computation, the checkpoint header write and the public
//! checkpoint requests.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::log::files::LogFileSet;
use crate::log::format::{CheckpointHeader, HeaderSlot};
use crate::log::lsn::{align_checkpoint_lsn, is_data_lsn, LOG_BLOCK_HDR_SIZE};
use crate::log::sys::LogSys;
use crate::primitives::concurrency::{poll_until, Poll, WaitStats};
use crate::types::{LogError, Lsn, Result};

/// Inputs of the available-for-checkpoint computation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AvailableInputs {
    /// Lsn up to which every dirty page is registered in the buffer pool.
    pub dirty_pages_added_up_to: Lsn,
    /// Oldest modification over dirty pages, 0 when there are none.
    pub oldest_modification_lwm: Lsn,
    /// Lsn up to which the log is durable.
    pub flushed_to_disk: Lsn,
    /// Lsn of the last written checkpoint.
    pub last_checkpoint: Lsn,
}

/// Highest lsn a checkpoint could be written at right now.
///
/// Starts from the registration watermark, lowers it to the oldest dirty page
/// and to the flushed lsn, moves it off block framing and never returns less
/// than the last checkpoint.
pub fn available_for_checkpoint(inputs: AvailableInputs) -> Lsn {
    let mut lsn = inputs.dirty_pages_added_up_to;
    if !inputs.oldest_modification_lwm.is_zero() {
        lsn = lsn.min(inputs.oldest_modification_lwm);
    }
    lsn = lsn.min(inputs.flushed_to_disk);
    match align_checkpoint_lsn(lsn) {
        Some(aligned) => aligned.max(inputs.last_checkpoint),
        None => inputs.last_checkpoint,
    }
}

/// Clamps `available` to the dictionary ceiling when one is set.
pub fn checkpoint_target(available: Lsn, dict_max: Lsn, last_checkpoint: Lsn) -> Lsn {
    let target = if dict_max.is_zero() {
        available
    } else {
        available.min(dict_max)
    };
    align_checkpoint_lsn(target)
        .unwrap_or(last_checkpoint)
        .max(last_checkpoint)
}

/// Why a checkpoint is being written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckpointReason {
    /// A caller requested a checkpoint beyond the last one.
    Requested,
    /// The checkpoint age passed the aggressive threshold.
    Aggressive,
    /// The periodic interval elapsed.
    Periodic,
    /// The checkpoint still sits in a file older than the one being written.
    NextFile,
}

/// Everything [`CheckpointDecision::decide`] looks at, captured at one instant.
#[derive(Copy, Clone, Debug)]
pub struct CheckpointDecision {
    /// Checkpoints are enabled after recovery.
    pub enabled: bool,
    /// Checkpoints are disabled by a test.
    pub disabled_for_test: bool,
    /// Last written checkpoint.
    pub last: Lsn,
    /// Lsn a checkpoint would be written at.
    pub target: Lsn,
    /// Highest requested checkpoint lsn.
    pub requested: Lsn,
    /// Highest lsn a checkpoint could be written at.
    pub available: Lsn,
    /// Current write lsn.
    pub current: Lsn,
    /// Concurrency margin.
    pub margin: u64,
    /// Aggressive checkpoint age.
    pub aggressive_age: u64,
    /// Periodic checkpoints are on.
    pub periodic: bool,
    /// The periodic interval elapsed.
    pub periodic_due: bool,
    /// The checkpoint file is older than the file being written.
    pub checkpoint_file_behind: bool,
}

impl CheckpointDecision {
    /// Returns the reason to write a checkpoint at `target`, if any.
    ///
    /// A pending request fires once the available lsn reaches it. The
    /// checkpoint is then written at the target, which a dictionary ceiling
    /// may hold below the request.
    pub fn decide(&self) -> Option<CheckpointReason> {
        if !self.enabled || self.disabled_for_test || self.target <= self.last {
            return None;
        }
        if self.requested > self.last && self.requested <= self.available {
            return Some(CheckpointReason::Requested);
        }
        let age = (self.current + self.margin).saturating_since(self.last);
        if age > self.aggressive_age {
            return Some(CheckpointReason::Aggressive);
        }
        if self.periodic {
            if self.periodic_due {
                return Some(CheckpointReason::Periodic);
            }
            if self.checkpoint_file_behind {
                return Some(CheckpointReason::NextFile);
            }
        }
        None
    }
}

/// Checkpoint found by [`recover_checkpoint`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RecoveredCheckpoint {
    /// The checkpoint lsn.
    pub checkpoint_lsn: Lsn,
    /// File whose header holds it.
    pub file_id: u64,
    /// Slot it was read from.
    pub slot: HeaderSlot,
}

/// Reads both checkpoint slots of every file and returns the highest valid
/// checkpoint that lies inside its own file. Torn slots are skipped.
pub fn recover_checkpoint(files: &LogFileSet) -> Result<RecoveredCheckpoint> {
    let mut best: Option<RecoveredCheckpoint> = None;
    let mut raw = [0u8; crate::log::lsn::LOG_BLOCK_SIZE as usize];
    for file in files.iter() {
        for slot in HeaderSlot::ALL {
            file.io().read_at(slot.offset(), &mut raw)?;
            let header = match CheckpointHeader::decode(slot, &raw) {
                Ok(Some(header)) => header,
                Ok(None) => continue,
                Err(err) => {
                    warn!(file = file.id, ?slot, error = %err, "log.recover.torn_checkpoint");
                    continue;
                }
            };
            if !file.contains(header.checkpoint_lsn) || !is_data_lsn(header.checkpoint_lsn) {
                warn!(
                    file = file.id,
                    ?slot,
                    lsn = header.checkpoint_lsn.0,
                    "log.recover.misplaced_checkpoint"
                );
                continue;
            }
            if best.map_or(true, |b| header.checkpoint_lsn > b.checkpoint_lsn) {
                best = Some(RecoveredCheckpoint {
                    checkpoint_lsn: header.checkpoint_lsn,
                    file_id: file.id,
                    slot,
                });
            }
        }
    }
    best.ok_or(LogError::Corruption("no valid checkpoint in any log file"))
}

impl LogSys {
    /// Recomputes the available-for-checkpoint lsn from the buffer pool and
    /// the flushed lsn, stores it and returns it.
    pub fn compute_available_for_checkpoint_lsn(&self) -> Lsn {
        let pool = &self.collab.buffer_pool;
        let candidate = available_for_checkpoint(AvailableInputs {
            dirty_pages_added_up_to: pool.dirty_pages_added_up_to_lsn(),
            oldest_modification_lwm: pool.oldest_modification_lwm(),
            flushed_to_disk: self.flushed_to_disk_lsn(),
            last_checkpoint: self.last_checkpoint_lsn(),
        });
        self.limits
            .update_available_for_checkpoint(candidate, self.checkpoints_enabled())
    }

    /// Lsn the next checkpoint would be written at.
    pub fn checkpoint_target(&self) -> Lsn {
        checkpoint_target(
            self.limits.available_for_checkpoint_lsn(),
            self.limits.dict_max_allowed_checkpoint_lsn(),
            self.last_checkpoint_lsn(),
        )
    }

    pub(crate) fn checkpoints_enabled(&self) -> bool {
        self.checkpoints_enabled.load(Ordering::Acquire)
    }

    /// Snapshot of the inputs of the checkpoint decision.
    pub(crate) fn checkpoint_decision(&self, periodic_due: bool) -> CheckpointDecision {
        let last = self.last_checkpoint_lsn();
        let current = self.current_lsn();
        CheckpointDecision {
            enabled: self.checkpoints_enabled(),
            disabled_for_test: self.checkpoints_disabled_for_test.load(Ordering::Acquire),
            last,
            target: self.checkpoint_target(),
            requested: self.limits.requested_checkpoint_lsn(),
            available: self.limits.available_for_checkpoint_lsn(),
            current,
            margin: self.limits.concurrency_margin(),
            aggressive_age: self.checkpoint_ages().aggressive_checkpoint_min_age,
            periodic: self.periodic_checkpoints.load(Ordering::Acquire),
            periodic_due,
            checkpoint_file_behind: self.file_index_of(last) < self.file_index_of(current),
        }
    }

    /// Writes a checkpoint at `lsn` into the non-current slot of the file
    /// holding it, fsyncs, and only then publishes the new checkpoint.
    ///
    /// `lsn` must lie inside a block payload and must be durable. A checkpoint
    /// at or below the current one is a no-op. On error nothing changes in
    /// memory.
    pub fn write_checkpoint(&self, lsn: Lsn) -> Result<()> {
        assert!(is_data_lsn(lsn), "checkpoint lsn {lsn} is on block framing");
        let (mut writer, mut files) = self.lock_for_header_write();
        let last = self.last_checkpoint_lsn();
        if lsn <= last {
            return Ok(());
        }
        assert!(
            lsn <= self.flushed_to_disk_lsn(),
            "checkpoint lsn {lsn} is beyond the flushed lsn"
        );
        let (file_id, io) = {
            let file = files
                .find(lsn)
                .ok_or(LogError::Corruption("checkpoint lsn outside the log files"))?;
            (file.id, std::sync::Arc::clone(file.io()))
        };
        let moved = file_id != writer.checkpoint_file;
        if moved {
            if let Some(metadata) = writer.encryption_metadata() {
                let state = self.persist_encryption(&files, file_id, metadata, true)?;
                writer.set_encryption(state);
            }
        }
        let slot = if moved {
            HeaderSlot::First
        } else {
            writer.checkpoint_slot.other()
        };
        let written = io
            .write_at(slot.offset(), &CheckpointHeader { checkpoint_lsn: lsn }.encode(slot))
            .and_then(|()| io.sync_all());
        if let Err(err) = written {
            self.metrics().checkpoint_failed();
            return Err(err);
        }
        self.store_last_checkpoint_lsn(lsn);
        writer.checkpoint_slot = slot;
        writer.checkpoint_file = file_id;
        self.limits.update_free_check_limit(
            writer.in_extra_margin(),
            lsn,
            self.free_check_capacity(),
        );
        let current = writer.current_lsn();
        drop(writer);
        match files.consume(lsn, current) {
            Ok(consumed) if !consumed.is_empty() => {
                debug!(count = consumed.len(), "log.checkpoint.consumed_files");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "log.checkpoint.consume_failed"),
        }
        drop(files);
        self.metrics().checkpoint_written(lsn.0);
        info!(lsn = lsn.0, file = file_id, ?slot, "log.checkpoint.write");
        self.checkpoint_done.notify();
        Ok(())
    }

    /// Requests a checkpoint at the current lsn. With `sync` the log is made
    /// durable, the buffer pool is flushed and the call returns once the
    /// checkpoint reached that lsn.
    pub fn request_checkpoint(&self, sync: bool) -> Result<()> {
        let lsn = self.current_lsn();
        if self.limits.request_checkpoint(lsn, self.last_checkpoint_lsn()) {
            self.checkpointer_event.notify();
        }
        if !sync {
            return Ok(());
        }
        self.write_up_to(lsn, true)?;
        self.metrics().flush_requested(true);
        self.collab.buffer_pool.flush_up_to(lsn, true);
        let target = align_checkpoint_lsn(lsn).unwrap_or(lsn);
        self.wait_for_checkpoint(target)?;
        Ok(())
    }

    /// Blocks until the last checkpoint reached `lsn`.
    pub fn wait_for_checkpoint(&self, lsn: Lsn) -> Result<WaitStats> {
        poll_until(
            &self.wait_options("checkpoint"),
            Some(&self.checkpoint_done),
            || {
                if self.last_checkpoint_lsn() >= lsn {
                    Poll::Ready
                } else if self.is_shutting_down() {
                    Poll::Interrupted
                } else {
                    Poll::Pending
                }
            },
        )
    }

    /// Requests a synchronous checkpoint and reports whether the checkpoint
    /// moved.
    pub fn make_latest_checkpoint(&self) -> Result<bool> {
        let before = self.last_checkpoint_lsn();
        self.request_checkpoint(true)?;
        Ok(self.last_checkpoint_lsn() > before)
    }

    /// Pads the log into the next file and checkpoints there, so the files
    /// before it become reclaimable.
    pub fn request_checkpoint_in_next_file(&self) -> Result<()> {
        let end = {
            let files = self.files.lock();
            let current = self.current_lsn();
            files
                .find(current)
                .map(|file| file.end_lsn)
                .ok_or(LogError::Corruption("current lsn outside the log files"))?
        };
        self.pad_to(end + LOG_BLOCK_HDR_SIZE)?;
        self.request_checkpoint(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(dpa: u64, lwm: u64, flushed: u64, last: u64) -> AvailableInputs {
        AvailableInputs {
            dirty_pages_added_up_to: Lsn(dpa),
            oldest_modification_lwm: Lsn(lwm),
            flushed_to_disk: Lsn(flushed),
            last_checkpoint: Lsn(last),
        }
    }

    #[test]
    fn available_takes_minimum_of_inputs() {
        assert_eq!(
            available_for_checkpoint(inputs(9000, 8800, 9500, 8204)),
            Lsn(8800)
        );
        assert_eq!(
            available_for_checkpoint(inputs(9000, 0, 8900, 8204)),
            Lsn(8900)
        );
    }

    #[test]
    fn available_moves_off_block_boundary() {
        // 9216 is a block start; step back one block past its header.
        assert_eq!(
            available_for_checkpoint(inputs(9216, 0, 9216, 8204)),
            Lsn(9216 - 512 + 12)
        );
    }

    #[test]
    fn available_never_below_last_checkpoint() {
        assert_eq!(
            available_for_checkpoint(inputs(8300, 8250, 8300, 8400)),
            Lsn(8400)
        );
    }

    #[test]
    fn dict_ceiling_clamps_target() {
        assert_eq!(checkpoint_target(Lsn(9000), Lsn(8600), Lsn(8204)), Lsn(8600));
        assert_eq!(checkpoint_target(Lsn(9000), Lsn::ZERO, Lsn(8204)), Lsn(9000));
        assert_eq!(checkpoint_target(Lsn(9000), Lsn(8000), Lsn(8204)), Lsn(8204));
    }

    fn decision() -> CheckpointDecision {
        CheckpointDecision {
            enabled: true,
            disabled_for_test: false,
            last: Lsn(8204),
            target: Lsn(9000),
            requested: Lsn::ZERO,
            available: Lsn(9000),
            current: Lsn(9100),
            margin: 100,
            aggressive_age: 10_000,
            periodic: false,
            periodic_due: false,
            checkpoint_file_behind: false,
        }
    }

    #[test]
    fn decision_requires_enabled_and_progress() {
        let mut d = decision();
        d.requested = Lsn(8800);
        assert_eq!(d.decide(), Some(CheckpointReason::Requested));
        d.enabled = false;
        assert_eq!(d.decide(), None);
        d.enabled = true;
        d.disabled_for_test = true;
        assert_eq!(d.decide(), None);
        d.disabled_for_test = false;
        d.target = d.last;
        assert_eq!(d.decide(), None);
    }

    #[test]
    fn decision_reasons() {
        let mut d = decision();
        assert_eq!(d.decide(), None);
        d.requested = Lsn(9500);
        assert_eq!(d.decide(), None, "request beyond available waits");
        d.available = Lsn(9600);
        assert_eq!(d.decide(), Some(CheckpointReason::Requested));
        d.requested = d.last;
        d.aggressive_age = 500;
        assert_eq!(d.decide(), Some(CheckpointReason::Aggressive));
        d.aggressive_age = 10_000;
        d.periodic = true;
        d.checkpoint_file_behind = true;
        assert_eq!(d.decide(), Some(CheckpointReason::NextFile));
        d.periodic_due = true;
        assert_eq!(d.decide(), Some(CheckpointReason::Periodic));
    }
}
