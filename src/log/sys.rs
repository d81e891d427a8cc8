//! The redo log object: file set, write path, limits and the checkpointer
//! thread, owned behind an `Arc` for the lifetime of the process.
//!
//! Lock order: `checkpointer_mutex` before `writer`, `writer` before `files`,
//! and the limits mutex innermost.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::log::capacity::{CheckpointAges, LogCapacity};
use crate::log::checkpoint::recover_checkpoint;
use crate::log::checkpointer::{spawn_checkpointer, CheckpointerState};
use crate::log::collab::{ActivityCounter, BufferPool, DictPersistence, NoopDictPersistence};
use crate::log::encryption::{decode_metadata, encode_metadata, EncryptionMetadata, EncryptionState, Keyring};
use crate::log::files::{ConsumerId, LogConsumer, LogFileInfo, LogFileSet};
use crate::log::format::{
    BlockHeader, CheckpointHeader, EncryptionBlock, HeaderSlot, ENCRYPTION_OFFSET,
    LOG_FILE_HDR_SIZE,
};
use crate::log::limits::{Limits, LimitsSnapshot};
use crate::log::lsn::{
    advance, block_no, block_offset, first_data_lsn, lsn_to_sn, LOG_BLOCK_HDR_SIZE,
    LOG_BLOCK_SIZE, LOG_BLOCK_TRL_SIZE, LOG_START_LSN,
};
use crate::log::metrics::{LogMetrics, NoopMetrics};
use crate::log::options::LogOptions;
use crate::primitives::concurrency::{poll_until, Event, Poll, WaitOptions, WaitStats};
use crate::primitives::io::{IoProvider, StdIoProvider};
use crate::types::{LogError, Lsn, Result, Sn};

const BLOCK: usize = LOG_BLOCK_SIZE as usize;
const BLOCK_DATA_END: usize = (LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE) as usize;

/// Everything the log needs from the rest of the engine.
#[derive(Clone)]
pub struct LogCollaborators {
    /// Dirty page bookkeeping.
    pub buffer_pool: Arc<dyn BufferPool>,
    /// Dictionary metadata persistence.
    pub dict: Arc<dyn DictPersistence>,
    /// Server activity counter.
    pub activity: Arc<ActivityCounter>,
    /// Key service; required when encryption is configured.
    pub keyring: Option<Arc<dyn Keyring>>,
    /// Opens data files.
    pub io: Arc<dyn IoProvider>,
    /// Metrics sink.
    pub metrics: Arc<dyn LogMetrics>,
}

impl LogCollaborators {
    /// Defaults around `buffer_pool`.
    pub fn new(buffer_pool: Arc<dyn BufferPool>) -> Self {
        Self {
            buffer_pool,
            dict: Arc::new(NoopDictPersistence),
            activity: Arc::new(ActivityCounter::default()),
            keyring: None,
            io: Arc::new(StdIoProvider),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Replaces the dictionary persistence.
    pub fn with_dict(mut self, dict: Arc<dyn DictPersistence>) -> Self {
        self.dict = dict;
        self
    }

    /// Installs a keyring.
    pub fn with_keyring(mut self, keyring: Arc<dyn Keyring>) -> Self {
        self.keyring = Some(keyring);
        self
    }

    /// Replaces the file opener.
    pub fn with_io(mut self, io: Arc<dyn IoProvider>) -> Self {
        self.io = io;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn LogMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// State guarded by `writer_mutex`: the write cursor, the partially filled
/// block, the checkpoint slot bookkeeping and the encryption block.
pub struct WriterState {
    block: Vec<u8>,
    block_lsn: Lsn,
    current_lsn: Lsn,
    first_rec_group: u16,
    in_extra_margin: bool,
    pub(crate) checkpoint_slot: HeaderSlot,
    pub(crate) checkpoint_file: u64,
    encryption: Option<EncryptionState>,
}

impl WriterState {
    /// Lsn following the last appended byte.
    pub fn current_lsn(&self) -> Lsn {
        self.current_lsn
    }

    pub(crate) fn in_extra_margin(&self) -> bool {
        self.in_extra_margin
    }

    pub(crate) fn encryption_block(&self) -> Option<&EncryptionBlock> {
        self.encryption.as_ref().map(|state| &state.block)
    }

    pub(crate) fn encryption_metadata(&self) -> Option<EncryptionMetadata> {
        self.encryption.as_ref().map(|state| state.metadata.clone())
    }

    pub(crate) fn set_encryption(&mut self, state: EncryptionState) {
        self.encryption = Some(state);
    }
}

/// Decrements the in-flight append counter on every exit path.
struct PendingAppend<'a>(&'a AtomicU64);

impl<'a> PendingAppend<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingAppend<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serializable view of the log's progress.
#[derive(Clone, Debug, serde::Serialize)]
pub struct LogStatus {
    /// Lsn following the last appended byte.
    pub current_lsn: u64,
    /// Lsn up to which the log is fsynced.
    pub flushed_to_disk_lsn: u64,
    /// Lsn of the last durable checkpoint.
    pub last_checkpoint_lsn: u64,
    /// Limits tracker state.
    pub limits: LimitsSnapshot,
    /// Capacity model.
    pub capacity: LogCapacity,
    /// Files on disk.
    pub files: Vec<LogFileInfo>,
}

/// The redo log.
pub struct LogSys {
    opts: LogOptions,
    capacity: LogCapacity,
    pub(crate) limits: Limits,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) files: Mutex<LogFileSet>,
    pub(crate) checkpointer_mutex: Mutex<CheckpointerState>,
    last_checkpoint_lsn: AtomicU64,
    current_lsn: AtomicU64,
    flushed_to_disk_lsn: AtomicU64,
    pending_appends: AtomicU64,
    free_check_capacity: AtomicU64,
    thread_concurrency: AtomicU64,
    pub(crate) checkpoints_enabled: AtomicBool,
    pub(crate) checkpoints_disabled_for_test: AtomicBool,
    pub(crate) periodic_checkpoints: AtomicBool,
    shutting_down: AtomicBool,
    pub(crate) checkpointer_event: Event,
    pub(crate) checkpoint_done: Event,
    flushed_event: Event,
    pub(crate) collab: LogCollaborators,
    checkpointer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LogSys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSys").finish_non_exhaustive()
    }
}

struct Recovered {
    files: LogFileSet,
    checkpoint_lsn: Lsn,
    checkpoint_slot: HeaderSlot,
    checkpoint_file: u64,
    current_lsn: Lsn,
    block: Vec<u8>,
    first_rec_group: u16,
    encryption: Option<EncryptionState>,
}

impl LogSys {
    /// Opens the log in `opts.dir`, creating it when the directory holds no
    /// log files, and starts the checkpointer thread.
    ///
    /// Checkpoints stay disabled until [`LogSys::enable_checkpoints`] is called
    /// once recovery and dictionary catch-up are complete.
    pub fn open(opts: LogOptions, collab: LogCollaborators) -> Result<Arc<Self>> {
        opts.validate()?;
        if opts.encryption && collab.keyring.is_none() {
            return Err(LogError::KeyringUnavailable);
        }
        std::fs::create_dir_all(&opts.dir)?;
        let budget = u64::from(opts.n_files);
        let existing = LogFileSet::open_existing(
            &opts.dir,
            opts.file_size,
            budget,
            &opts.creator,
            Arc::clone(&collab.io),
        )?;
        let recovered = match existing {
            Some(files) => Self::recover(files, &collab)?,
            None => Self::create(&opts, &collab, budget)?,
        };
        let capacity = opts.capacity();
        let block_lsn = recovered.current_lsn.align_down(LOG_BLOCK_SIZE);
        let log = Arc::new(Self {
            capacity,
            limits: Limits::new(recovered.checkpoint_lsn),
            writer: Mutex::new(WriterState {
                block: recovered.block,
                block_lsn,
                current_lsn: recovered.current_lsn,
                first_rec_group: recovered.first_rec_group,
                in_extra_margin: false,
                checkpoint_slot: recovered.checkpoint_slot,
                checkpoint_file: recovered.checkpoint_file,
                encryption: recovered.encryption,
            }),
            files: Mutex::new(recovered.files),
            checkpointer_mutex: Mutex::new(CheckpointerState::new(collab.activity.get())),
            last_checkpoint_lsn: AtomicU64::new(recovered.checkpoint_lsn.0),
            current_lsn: AtomicU64::new(recovered.current_lsn.0),
            flushed_to_disk_lsn: AtomicU64::new(recovered.current_lsn.0),
            pending_appends: AtomicU64::new(0),
            free_check_capacity: AtomicU64::new(0),
            thread_concurrency: AtomicU64::new(u64::from(opts.thread_concurrency)),
            checkpoints_enabled: AtomicBool::new(false),
            checkpoints_disabled_for_test: AtomicBool::new(false),
            periodic_checkpoints: AtomicBool::new(opts.periodic_checkpoints),
            shutting_down: AtomicBool::new(false),
            checkpointer_event: Event::new(),
            checkpoint_done: Event::new(),
            flushed_event: Event::new(),
            collab,
            checkpointer: Mutex::new(None),
            opts,
        });
        log.update_concurrency_margin();
        log.collab
            .buffer_pool
            .mark_added_up_to(recovered.current_lsn);
        if log.opts.encryption && log.encryption_metadata().is_none() {
            log.generate_new_encryption()?;
        }
        let handle = spawn_checkpointer(&log)?;
        *log.checkpointer.lock() = Some(handle);
        info!(
            dir = %log.opts.dir.display(),
            checkpoint_lsn = recovered.checkpoint_lsn.0,
            current_lsn = recovered.current_lsn.0,
            "log.open"
        );
        Ok(log)
    }

    fn create(opts: &LogOptions, collab: &LogCollaborators, budget: u64) -> Result<Recovered> {
        let log_uuid = Uuid::new_v4();
        let mut files = LogFileSet::new(
            &opts.dir,
            opts.file_size,
            budget,
            log_uuid,
            &opts.creator,
            Arc::clone(&collab.io),
        );
        let encryption = if opts.encryption {
            let metadata = EncryptionMetadata::generate();
            let block = encode_metadata(collab.keyring.as_deref(), log_uuid, &metadata, true)?;
            Some(EncryptionState { metadata, block })
        } else {
            None
        };
        let checkpoint_lsn = first_data_lsn();
        let encryption_block = encryption.as_ref().map(|state| state.block.clone());
        let file = files.create_next(LOG_START_LSN, None, encryption_block)?;
        let slot = HeaderSlot::First;
        file.io().write_at(
            slot.offset(),
            &CheckpointHeader { checkpoint_lsn }.encode(slot),
        )?;
        file.io().sync_all()?;
        let checkpoint_file = file.id;
        info!(dir = %opts.dir.display(), %log_uuid, "log.create");
        Ok(Recovered {
            files,
            checkpoint_lsn,
            checkpoint_slot: slot,
            checkpoint_file,
            current_lsn: checkpoint_lsn,
            block: vec![0u8; BLOCK],
            first_rec_group: 0,
            encryption,
        })
    }

    fn recover(files: LogFileSet, collab: &LogCollaborators) -> Result<Recovered> {
        let checkpoint = recover_checkpoint(&files)?;
        let encryption = {
            let file = files
                .get(checkpoint.file_id)
                .ok_or(LogError::Corruption("checkpoint file missing"))?;
            let mut raw = [0u8; BLOCK];
            file.io().read_at(ENCRYPTION_OFFSET, &mut raw)?;
            match EncryptionBlock::decode(&raw)? {
                Some(block) => Some(EncryptionState {
                    metadata: decode_metadata(collab.keyring.as_deref(), &block)?,
                    block,
                }),
                None => None,
            }
        };
        let (current_lsn, block, first_rec_group) =
            scan_log_end(&files, checkpoint.checkpoint_lsn)?;
        info!(
            checkpoint_lsn = checkpoint.checkpoint_lsn.0,
            end_lsn = current_lsn.0,
            "log.recover"
        );
        Ok(Recovered {
            files,
            checkpoint_lsn: checkpoint.checkpoint_lsn,
            checkpoint_slot: checkpoint.slot,
            checkpoint_file: checkpoint.file_id,
            current_lsn,
            block,
            first_rec_group,
            encryption,
        })
    }

    /// Options the log was opened with.
    pub fn options(&self) -> &LogOptions {
        &self.opts
    }

    /// Capacity model.
    pub fn capacity(&self) -> LogCapacity {
        self.capacity
    }

    /// Lsn following the last appended byte.
    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.current_lsn.load(Ordering::Acquire))
    }

    /// Payload bytes appended so far.
    pub fn current_sn(&self) -> Sn {
        lsn_to_sn(self.current_lsn())
    }

    /// Lsn up to which the log is durable.
    pub fn flushed_to_disk_lsn(&self) -> Lsn {
        Lsn(self.flushed_to_disk_lsn.load(Ordering::Acquire))
    }

    /// Lsn of the last durable checkpoint. May be stale, never regresses.
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        Lsn(self.last_checkpoint_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn store_last_checkpoint_lsn(&self, lsn: Lsn) {
        self.last_checkpoint_lsn.store(lsn.0, Ordering::Release);
    }

    /// Log space writers may use beyond the last checkpoint.
    pub fn free_check_capacity(&self) -> u64 {
        self.free_check_capacity.load(Ordering::Acquire)
    }

    /// Age thresholds for the current free-check capacity.
    pub fn checkpoint_ages(&self) -> CheckpointAges {
        CheckpointAges::new(self.free_check_capacity())
    }

    /// Copy of the limits tracker.
    pub fn limits_snapshot(&self) -> LimitsSnapshot {
        self.limits.snapshot()
    }

    /// Appends queued but not yet written.
    pub fn pending_appends(&self) -> u64 {
        self.pending_appends.load(Ordering::Acquire)
    }

    /// True once shutdown began.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn keyring(&self) -> Option<&dyn Keyring> {
        self.collab.keyring.as_deref()
    }

    pub(crate) fn metrics(&self) -> &dyn LogMetrics {
        self.collab.metrics.as_ref()
    }

    pub(crate) fn wait_options(&self, what: &'static str) -> WaitOptions {
        WaitOptions::new(what, self.opts.free_check_sleep, self.opts.wait_alert_every)
    }

    /// Event notified whenever `flushed_to_disk_lsn` advances.
    pub fn flushed_event(&self) -> &Event {
        &self.flushed_event
    }

    /// Index of the file holding `lsn`; files are numbered from zero at
    /// [`LOG_START_LSN`].
    pub(crate) fn file_index_of(&self, lsn: Lsn) -> u64 {
        lsn.saturating_since(LOG_START_LSN) / (self.opts.file_size - LOG_FILE_HDR_SIZE)
    }

    /// Takes `writer_mutex` then `files_mutex`, the order every header write
    /// uses.
    pub fn lock_for_header_write(
        &self,
    ) -> (MutexGuard<'_, WriterState>, MutexGuard<'_, LogFileSet>) {
        let writer = self.writer.lock();
        let files = self.files.lock();
        (writer, files)
    }

    /// Allows checkpoints; called once recovery and dictionary catch-up are
    /// complete.
    pub fn enable_checkpoints(&self) {
        self.checkpoints_enabled.store(true, Ordering::Release);
        self.checkpointer_event.notify();
        debug!("log.checkpoints.enabled");
    }

    /// Stops the checkpointer from writing checkpoints, for tests.
    pub fn disable_checkpoints_for_test(&self, disabled: bool) {
        self.checkpoints_disabled_for_test
            .store(disabled, Ordering::Release);
        self.checkpointer_event.notify();
    }

    /// Turns periodic checkpoints on or off.
    pub fn set_periodic_checkpoints(&self, enabled: bool) {
        self.periodic_checkpoints.store(enabled, Ordering::Release);
        self.checkpointer_event.notify();
    }

    /// Changes the writer concurrency limit and recomputes the margin.
    pub fn set_thread_concurrency(&self, threads: u32) {
        self.thread_concurrency
            .store(u64::from(threads), Ordering::Release);
        self.update_concurrency_margin();
    }

    /// Sets the checkpoint ceiling imposed by dictionary metadata; 0 clears it.
    pub fn set_dict_max_allowed_checkpoint_lsn(&self, lsn: Lsn) {
        self.limits.set_dict_max_allowed_checkpoint_lsn(lsn);
        self.checkpointer_event.notify();
    }

    /// Recomputes the concurrency margin and the free-check capacity derived
    /// from it. An unsafe margin is reported and applied anyway.
    pub fn update_concurrency_margin(&self) -> (u64, bool) {
        let (margin, is_safe) = self.limits.update_concurrency_margin(
            &self.capacity,
            self.thread_concurrency.load(Ordering::Acquire),
            u64::from(self.opts.page_size),
        );
        let fcc = self.capacity.free_check_capacity(margin);
        self.free_check_capacity.store(fcc, Ordering::Release);
        let in_extra_margin = self.writer.lock().in_extra_margin;
        self.limits
            .update_free_check_limit(in_extra_margin, self.last_checkpoint_lsn(), fcc);
        (margin, is_safe)
    }

    /// Appends one record and registers the pages it dirtied. Returns the lsn
    /// range the record occupies.
    ///
    /// Callers are expected to pass [`LogSys::free_check`] first; when the
    /// writer would still exceed the hard capacity it waits in the extra
    /// margin for the checkpoint to advance.
    pub fn append(&self, payload: &[u8], dirty_pages: &[u64]) -> Result<(Lsn, Lsn)> {
        self.append_inner(payload, dirty_pages, false)
    }

    fn append_inner(&self, payload: &[u8], dirty_pages: &[u64], padding: bool) -> Result<(Lsn, Lsn)> {
        if self.is_shutting_down() {
            return Err(LogError::Interrupted);
        }
        let len = payload.len() as u64;
        if len > self.free_check_capacity() {
            return Err(LogError::Invalid("record larger than the free-check capacity"));
        }
        let _pending = PendingAppend::new(&self.pending_appends);
        let (start, end) = loop {
            let mut writer = self.writer.lock();
            let start = writer.current_lsn;
            let end = advance(start, len);
            let last = self.last_checkpoint_lsn();
            if end.saturating_since(last) > self.capacity.hard_logical {
                writer.in_extra_margin = true;
                drop(writer);
                self.wait_in_extra_margin(end)?;
                continue;
            }
            if writer.in_extra_margin {
                writer.in_extra_margin = false;
                self.limits
                    .update_free_check_limit(false, last, self.free_check_capacity());
            }
            self.write_payload(&mut writer, payload, padding)?;
            self.collab.buffer_pool.register_dirty_pages(dirty_pages, start);
            self.collab.buffer_pool.mark_added_up_to(end);
            break (start, end);
        };
        self.collab.activity.bump();
        if self.opts.flush_sync {
            self.write_up_to(end, true)?;
        }
        Ok((start, end))
    }

    fn wait_in_extra_margin(&self, needed: Lsn) -> Result<()> {
        let last = self.last_checkpoint_lsn();
        self.limits
            .update_free_check_limit(true, last, self.free_check_capacity());
        warn!(
            needed_lsn = needed.0,
            last_checkpoint = last.0,
            hard_capacity = self.capacity.hard_logical,
            "log.writer.extra_margin"
        );
        let target = Lsn(needed.0.saturating_sub(self.capacity.hard_logical));
        if self.limits.request_checkpoint(target, last) {
            self.checkpointer_event.notify();
        }
        let hard = self.capacity.hard_logical;
        poll_until(
            &self.wait_options("log space in extra margin"),
            Some(&self.checkpoint_done),
            || {
                if self.is_shutting_down() {
                    Poll::Interrupted
                } else if needed.saturating_since(self.last_checkpoint_lsn()) <= hard {
                    Poll::Ready
                } else {
                    Poll::Pending
                }
            },
        )?;
        Ok(())
    }

    /// Copies `payload` into blocks and writes each touched block. The writer
    /// state only changes once every block reached its file.
    fn write_payload(
        &self,
        writer: &mut MutexGuard<'_, WriterState>,
        payload: &[u8],
        padding: bool,
    ) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let mut block = writer.block.clone();
        let mut block_lsn = writer.block_lsn;
        let mut used = block_offset(writer.current_lsn) as usize;
        let mut first_rec_group = writer.first_rec_group;
        let mut record_started = padding;
        let mut rest = payload;
        let mut files = self.files.lock();
        while !rest.is_empty() {
            if !record_started {
                if first_rec_group == 0 {
                    first_rec_group = used as u16;
                }
                record_started = true;
            }
            let n = (BLOCK_DATA_END - used).min(rest.len());
            block[used..used + n].copy_from_slice(&rest[..n]);
            used += n;
            rest = &rest[n..];
            BlockHeader {
                block_no: (block_no(block_lsn) & u64::from(u32::MAX)) as u32,
                data_len: used as u16,
                first_rec_group,
            }
            .seal(&mut block);
            self.write_block(&mut files, writer, block_lsn, &block)?;
            if used == BLOCK_DATA_END {
                block_lsn = block_lsn + LOG_BLOCK_SIZE;
                block.fill(0);
                used = LOG_BLOCK_HDR_SIZE as usize;
                first_rec_group = 0;
            }
        }
        drop(files);
        writer.block = block;
        writer.block_lsn = block_lsn;
        writer.first_rec_group = first_rec_group;
        writer.current_lsn = block_lsn + used as u64;
        self.current_lsn
            .store(writer.current_lsn.0, Ordering::Release);
        Ok(())
    }

    fn write_block(
        &self,
        files: &mut MutexGuard<'_, LogFileSet>,
        writer: &WriterState,
        block_lsn: Lsn,
        block: &[u8],
    ) -> Result<()> {
        while files
            .newest()
            .map_or(true, |newest| newest.end_lsn <= block_lsn)
        {
            files.create_next(LOG_START_LSN, None, writer.encryption_block().cloned())?;
        }
        let file = files
            .find(block_lsn)
            .ok_or(LogError::Corruption("log block below the oldest file"))?;
        file.io().write_at(file.offset_of(block_lsn), block)
    }

    /// Pads the log with filler bytes until `target`.
    pub(crate) fn pad_to(&self, target: Lsn) -> Result<()> {
        let current = self.current_lsn();
        if target <= current {
            return Ok(());
        }
        let len = lsn_to_sn(target).0 - lsn_to_sn(current).0;
        let filler = vec![0u8; len as usize];
        self.append_inner(&filler, &[], true)?;
        Ok(())
    }

    /// Makes the log durable up to at least `lsn` when `flush_to_disk` is set.
    /// Appends reach the files immediately, so without a flush there is
    /// nothing to wait for.
    pub fn write_up_to(&self, lsn: Lsn, flush_to_disk: bool) -> Result<WaitStats> {
        if !flush_to_disk || self.flushed_to_disk_lsn() >= lsn {
            return Ok(WaitStats::default());
        }
        let start = Instant::now();
        let (target, ios) = {
            let writer = self.writer.lock();
            let files = self.files.lock();
            let current = writer.current_lsn;
            (current, files.covering(self.flushed_to_disk_lsn(), current))
        };
        for io in ios {
            io.sync_all()?;
        }
        self.flushed_to_disk_lsn
            .fetch_max(target.0, Ordering::AcqRel);
        self.flushed_event.notify();
        Ok(WaitStats {
            rounds: 1,
            waited: start.elapsed(),
        })
    }

    /// Reads `buf.len()` bytes of the framed stream starting at `lsn`.
    pub fn read_log(&self, lsn: Lsn, buf: &mut [u8]) -> Result<()> {
        let mut pos = lsn;
        let mut done = 0usize;
        while done < buf.len() {
            let (io, offset, available) = {
                let files = self.files.lock();
                let file = files.find(pos).ok_or(LogError::NotFound)?;
                (
                    Arc::clone(file.io()),
                    file.offset_of(pos),
                    file.end_lsn.0 - pos.0,
                )
            };
            let n = (available as usize).min(buf.len() - done);
            io.read_at(offset, &mut buf[done..done + n])?;
            done += n;
            pos = pos + n as u64;
        }
        Ok(())
    }

    /// Registers a consumer that holds back file reclamation.
    pub fn register_consumer(&self, consumer: Arc<dyn LogConsumer>) -> ConsumerId {
        self.files.lock().register_consumer(consumer)
    }

    /// Removes a consumer.
    pub fn unregister_consumer(&self, id: ConsumerId) {
        self.files.lock().unregister_consumer(id);
    }

    /// Descriptions of the files on disk.
    pub fn files_snapshot(&self) -> Vec<LogFileInfo> {
        self.files.lock().infos()
    }

    /// Progress summary.
    pub fn status(&self) -> LogStatus {
        LogStatus {
            current_lsn: self.current_lsn().0,
            flushed_to_disk_lsn: self.flushed_to_disk_lsn().0,
            last_checkpoint_lsn: self.last_checkpoint_lsn().0,
            limits: self.limits_snapshot(),
            capacity: self.capacity,
            files: self.files_snapshot(),
        }
    }

    /// Stops the checkpointer after its shutdown barrier and syncs the log.
    /// Blocking waits in other threads return [`LogError::Interrupted`].
    pub fn shutdown(&self) -> Result<()> {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("log.shutdown.begin");
        }
        self.checkpointer_event.notify();
        self.checkpoint_done.notify();
        self.flushed_event.notify();
        let handle = self.checkpointer.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| LogError::Invalid("checkpointer thread panicked"))?;
        }
        self.write_up_to(self.current_lsn(), true)?;
        info!(
            last_checkpoint = self.last_checkpoint_lsn().0,
            current_lsn = self.current_lsn().0,
            "log.shutdown.complete"
        );
        Ok(())
    }

    /// Waits until no append is in flight, the log is durable up to the
    /// current lsn and every dirty page up to it is registered.
    pub(crate) fn wait_for_quiescence(&self, alert_every: Duration) -> Result<WaitStats> {
        let opts = WaitOptions::new("log writes to quiesce", self.opts.free_check_sleep, alert_every);
        poll_until(&opts, Some(&self.flushed_event), || {
            if self.pending_appends() > 0 {
                return Poll::Pending;
            }
            let current = self.current_lsn();
            if let Err(err) = self.write_up_to(current, true) {
                warn!(error = %err, "log.shutdown.flush_failed");
                return Poll::Pending;
            }
            if self.collab.buffer_pool.dirty_pages_added_up_to_lsn() < current {
                return Poll::Pending;
            }
            Poll::Ready
        })
    }
}

/// Finds the end of the log by walking valid blocks from the checkpoint.
/// Returns the end lsn, the image of the block it falls in and that block's
/// first record offset.
fn scan_log_end(files: &LogFileSet, checkpoint_lsn: Lsn) -> Result<(Lsn, Vec<u8>, u16)> {
    let mut block_lsn = checkpoint_lsn.align_down(LOG_BLOCK_SIZE);
    let mut raw = vec![0u8; BLOCK];
    loop {
        let Some(file) = files.find(block_lsn) else {
            return Ok((block_lsn + LOG_BLOCK_HDR_SIZE, vec![0u8; BLOCK], 0));
        };
        file.io().read_at(file.offset_of(block_lsn), &mut raw)?;
        let header = match BlockHeader::decode(block_no(block_lsn), &raw) {
            Ok(header) => header,
            Err(_) => {
                let end = (block_lsn + LOG_BLOCK_HDR_SIZE).max(checkpoint_lsn);
                return Ok((end, vec![0u8; BLOCK], 0));
            }
        };
        if usize::from(header.data_len) == BLOCK_DATA_END {
            block_lsn = block_lsn + LOG_BLOCK_SIZE;
            continue;
        }
        let end = (block_lsn + u64::from(header.data_len)).max(checkpoint_lsn);
        return Ok((end, raw, header.first_rec_group));
    }
}
