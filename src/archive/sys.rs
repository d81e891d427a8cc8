//! The log archiver: copies complete log blocks into the current group while
//! registered as a log consumer, so the files it still needs are never
//! reclaimed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::group::{ArchGroup, GroupSpec};
use crate::archive::state::{transition, ArchEvent, ArchState};
use crate::log::lsn::{block_offset, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE};
use crate::log::{ArchiveOptions, ConsumerId, LogConsumer, LogSys};
use crate::primitives::concurrency::{poll_until, Event, Poll, WaitOptions};
use crate::types::{LogError, Lsn, Result};

/// Log consumer whose consumed lsn is the archived lsn.
struct ArchConsumer {
    archived_lsn: Arc<AtomicU64>,
}

impl LogConsumer for ArchConsumer {
    fn name(&self) -> &str {
        "archiver"
    }

    fn consumed_lsn(&self) -> Lsn {
        Lsn(self.archived_lsn.load(Ordering::Acquire))
    }
}

/// Result of [`ArchLogSys::start`].
pub struct ArchStart {
    /// Group the client is attached to.
    pub group: Arc<ArchGroup>,
    /// First lsn the client receives; block aligned.
    pub begin_lsn: Lsn,
    /// Header region to place in front of the copied data.
    pub header: Vec<u8>,
}

/// Result of [`ArchLogSys::stop`].
#[derive(Clone, Debug)]
pub struct ArchStop {
    /// Block-aligned lsn up to which the archive files hold data.
    pub end_lsn: Lsn,
    /// Image of the partially filled block at `end_lsn`.
    pub trailer: Vec<u8>,
    /// Bytes of `trailer` to use, 0 when the block holds no payload.
    pub trailer_len: usize,
}

/// Cursor of the archiver task.
#[derive(Debug, Default)]
pub struct ArchCopyCtx {
    /// Next lsn to copy.
    pub arch_lsn: Lsn,
    /// Set when there was nothing to do and the caller should sleep.
    pub need_wait: bool,
    group: Option<Uuid>,
    buf: Vec<u8>,
}

struct ArchInner {
    state: ArchState,
    current: Option<Arc<ArchGroup>>,
    retained: Vec<Arc<ArchGroup>>,
    consumer: Option<ConsumerId>,
}

/// Log archiver.
pub struct ArchLogSys {
    log: Arc<LogSys>,
    opts: ArchiveOptions,
    inner: Mutex<ArchInner>,
    archived_lsn: Arc<AtomicU64>,
    progress: Event,
    shutting_down: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ArchLogSys {
    /// Creates the archiver for `log` and starts its background task.
    pub fn open(log: Arc<LogSys>, opts: ArchiveOptions) -> Result<Arc<Self>> {
        let sys = Self::open_without_worker(log, opts)?;
        let worker = Arc::clone(&sys);
        let handle = thread::Builder::new()
            .name("log-archiver".to_owned())
            .spawn(move || worker.run())?;
        *sys.worker.lock() = Some(handle);
        Ok(sys)
    }

    /// Creates the archiver without a background task; the caller drives
    /// [`ArchLogSys::archive`] itself.
    pub fn open_without_worker(log: Arc<LogSys>, opts: ArchiveOptions) -> Result<Arc<Self>> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)?;
        Ok(Arc::new(Self {
            log,
            opts,
            inner: Mutex::new(ArchInner {
                state: ArchState::Init,
                current: None,
                retained: Vec::new(),
                consumer: None,
            }),
            archived_lsn: Arc::new(AtomicU64::new(0)),
            progress: Event::new(),
            shutting_down: AtomicBool::new(false),
            worker: Mutex::new(None),
        }))
    }

    /// Current state.
    pub fn state(&self) -> ArchState {
        self.inner.lock().state
    }

    /// Lsn up to which log data has been copied.
    pub fn archived_lsn(&self) -> Lsn {
        Lsn(self.archived_lsn.load(Ordering::Acquire))
    }

    /// The group being archived, if any.
    pub fn current_group(&self) -> Option<Arc<ArchGroup>> {
        self.inner.lock().current.clone()
    }

    fn wait_options(&self, what: &'static str) -> WaitOptions {
        WaitOptions::new(what, self.opts.background_timeout, self.opts.wait_alert_every)
    }

    fn apply(inner: &mut ArchInner, event: ArchEvent) -> bool {
        match transition(inner.state, event) {
            Some(next) => {
                debug!(from = ?inner.state, to = ?next, ?event, "arch.state");
                inner.state = next;
                true
            }
            None => false,
        }
    }

    /// Starts archiving for one client. The log is checkpointed first so the
    /// client begins close to the current lsn.
    ///
    /// Returns the group, the block-aligned begin lsn and the header region
    /// the client writes in front of the data.
    pub fn start(&self, durable: bool) -> Result<ArchStart> {
        self.check_startable()?;
        self.log.request_checkpoint(true)?;
        loop {
            poll_until(
                &self.wait_options("archiver to become idle"),
                Some(&self.progress),
                || match self.state() {
                    ArchState::PrepareIdle => Poll::Pending,
                    _ if self.is_shutting_down() => Poll::Interrupted,
                    _ => Poll::Ready,
                },
            )?;
            let mut inner = self.inner.lock();
            let (writer, mut files) = self.log.lock_for_header_write();
            let anchor = self.log.last_checkpoint_lsn();
            let begin = anchor.align_down(LOG_BLOCK_SIZE);
            let group = match inner.state {
                ArchState::Init | ArchState::Idle => {
                    self.archived_lsn.store(begin.0, Ordering::Release);
                    let consumer = files.register_consumer(Arc::new(ArchConsumer {
                        archived_lsn: Arc::clone(&self.archived_lsn),
                    }));
                    let group = match ArchGroup::create(GroupSpec {
                        root: &self.opts.dir,
                        file_size: self.opts.file_size,
                        begin_lsn: begin,
                        anchor_lsn: anchor,
                        log_uuid: files.log_uuid(),
                        creator: &self.log.options().creator,
                        encryption: writer.encryption_block().cloned(),
                        durable,
                        io: Arc::clone(&self.log.collab.io),
                    }) {
                        Ok(group) => group,
                        Err(err) => {
                            files.unregister_consumer(consumer);
                            return Err(err);
                        }
                    };
                    inner.consumer = Some(consumer);
                    inner.current = Some(Arc::clone(&group));
                    inner.retained.push(Arc::clone(&group));
                    Self::apply(&mut inner, ArchEvent::ClientStart);
                    group
                }
                ArchState::Active => {
                    let group = inner
                        .current
                        .clone()
                        .ok_or(LogError::Invalid("active archiver without a group"))?;
                    group.attach(durable);
                    group
                }
                ArchState::PrepareIdle => continue,
                ArchState::Abort => return Err(LogError::Interrupted),
                ArchState::ReadOnly => return Err(LogError::ReadOnly),
            };
            drop(files);
            drop(writer);
            drop(inner);
            self.progress.notify();
            info!(group = %group.uuid(), begin_lsn = begin.0, durable, "arch.start");
            let header = group.client_header(begin, anchor);
            return Ok(ArchStart {
                group,
                begin_lsn: begin,
                header,
            });
        }
    }

    fn check_startable(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(LogError::Interrupted);
        }
        match self.state() {
            ArchState::Abort => Err(LogError::Interrupted),
            ArchState::ReadOnly => Err(LogError::ReadOnly),
            _ => Ok(()),
        }
    }

    /// Stops archiving for one client once everything up to the current lsn
    /// has been copied. The partially filled last block is returned as the
    /// trailer instead of being archived.
    ///
    /// Fails with [`LogError::ArchiverFailed`] once `group` is no longer the
    /// group being archived, for instance after a copy error.
    pub fn stop(&self, group: &Arc<ArchGroup>) -> Result<ArchStop> {
        if self.is_shutting_down() {
            return Err(LogError::Interrupted);
        }
        if !self.is_archiving(group) {
            warn!(group = %group.uuid(), state = ?self.state(), "arch.stop.group_lost");
            return Err(LogError::ArchiverFailed);
        }
        let current = self.log.current_lsn();
        self.log.write_up_to(current, true)?;
        let end = current.align_down(LOG_BLOCK_SIZE);
        let mut trailer = vec![0u8; LOG_BLOCK_SIZE as usize];
        let trailer_len = if block_offset(current) > LOG_BLOCK_HDR_SIZE {
            self.log.read_log(end, &mut trailer)?;
            LOG_BLOCK_SIZE as usize
        } else {
            0
        };
        self.progress.notify();
        poll_until(
            &self.wait_options("archiver to reach the stop lsn"),
            Some(&self.progress),
            || {
                if self.is_shutting_down() {
                    Poll::Interrupted
                } else if !self.is_archiving(group) {
                    Poll::Failed(LogError::ArchiverFailed)
                } else if self.archived_lsn() >= end {
                    Poll::Ready
                } else {
                    Poll::Pending
                }
            },
        )?;
        let mut inner = self.inner.lock();
        let remaining = group.detach(end);
        let is_current = inner
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, group));
        if remaining == 0 && is_current {
            Self::apply(&mut inner, ArchEvent::LastClientStopped);
        }
        drop(inner);
        self.progress.notify();
        info!(group = %group.uuid(), end_lsn = end.0, trailer_len, "arch.stop");
        Ok(ArchStop {
            end_lsn: end,
            trailer,
            trailer_len,
        })
    }

    /// True while `group` is the active group receiving log data.
    fn is_archiving(&self, group: &Arc<ArchGroup>) -> bool {
        let inner = self.inner.lock();
        inner.state == ArchState::Active
            && inner
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, group))
            && group.is_active()
    }

    /// Drops a client's reference to `group`. The group is destroyed once
    /// nobody references it and the archiver finished with it.
    pub fn release(&self, group: &Arc<ArchGroup>, durable: bool) {
        let mut inner = self.inner.lock();
        if group.release() {
            inner.retained.retain(|g| !Arc::ptr_eq(g, group));
            drop(inner);
            group.destroy();
        }
        debug!(group = %group.uuid(), durable, "arch.release");
    }

    /// One step of the archiver task. Returns true once the archiver was
    /// aborted and the task should exit.
    ///
    /// `init` resets the cursor to the archived lsn. When there is nothing to
    /// copy `ctx.need_wait` is set.
    pub fn archive(&self, init: bool, ctx: &mut ArchCopyCtx) -> bool {
        let (state, group) = {
            let inner = self.inner.lock();
            (inner.state, inner.current.clone())
        };
        match state {
            ArchState::Abort | ArchState::ReadOnly => return true,
            ArchState::Init | ArchState::Idle => {
                ctx.need_wait = true;
                return false;
            }
            ArchState::PrepareIdle => {
                self.finalize();
                ctx.group = None;
                ctx.need_wait = false;
                return false;
            }
            ArchState::Active => {}
        }
        let Some(group) = group else {
            ctx.need_wait = true;
            return false;
        };
        if init || ctx.group != Some(group.uuid()) {
            ctx.group = Some(group.uuid());
            ctx.arch_lsn = self.archived_lsn();
        }
        let limit = self.log.flushed_to_disk_lsn().align_down(LOG_BLOCK_SIZE);
        if ctx.arch_lsn >= limit {
            ctx.need_wait = true;
            return false;
        }
        let chunk = Lsn(self.opts.chunk_size).align_down(LOG_BLOCK_SIZE).0;
        let len = limit.saturating_since(ctx.arch_lsn).min(chunk);
        ctx.buf.resize(len as usize, 0);
        let copied = self
            .log
            .read_log(ctx.arch_lsn, &mut ctx.buf)
            .and_then(|()| group.write(ctx.arch_lsn, &ctx.buf))
            .and_then(|()| group.sync());
        match copied {
            Ok(()) => {
                ctx.arch_lsn = ctx.arch_lsn + len;
                self.archived_lsn.fetch_max(ctx.arch_lsn.0, Ordering::AcqRel);
                self.log.collab.metrics.archived(len);
                debug!(lsn = ctx.arch_lsn.0, bytes = len, "arch.copy");
                ctx.need_wait = false;
            }
            Err(err) => {
                error!(lsn = ctx.arch_lsn.0, error = %err, "arch.copy_failed");
                self.log.collab.metrics.archive_failed();
                let mut inner = self.inner.lock();
                Self::apply(&mut inner, ArchEvent::CopyFailed);
                ctx.need_wait = false;
            }
        }
        self.progress.notify();
        false
    }

    /// Leaves `PrepareIdle`: unregisters the consumer and closes the group.
    fn finalize(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ArchState::PrepareIdle {
            return;
        }
        if let Some(consumer) = inner.consumer.take() {
            self.log.unregister_consumer(consumer);
        }
        let destroy = inner.current.take().and_then(|group| {
            group.mark_inactive();
            if group.is_unreferenced() {
                Some(group)
            } else {
                None
            }
        });
        if let Some(group) = &destroy {
            inner.retained.retain(|g| !Arc::ptr_eq(g, group));
        }
        Self::apply(&mut inner, ArchEvent::Finalized);
        if self.is_shutting_down() {
            Self::apply(&mut inner, ArchEvent::Shutdown);
        }
        drop(inner);
        if let Some(group) = destroy {
            group.destroy();
        }
        self.progress.notify();
        info!("arch.finalize");
    }

    fn run(&self) {
        debug!("arch.worker.start");
        let mut ctx = ArchCopyCtx::default();
        let mut init = true;
        loop {
            let seen = self.log.flushed_event().generation();
            if self.archive(init, &mut ctx) {
                break;
            }
            init = false;
            if ctx.need_wait {
                self.log
                    .flushed_event()
                    .wait_past(seen, self.opts.background_timeout);
            }
        }
        debug!("arch.worker.exit");
    }

    /// True once shutdown began.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Disables archiving for good; clients waiting in `stop` fail.
    pub fn force_read_only(&self) {
        let mut inner = self.inner.lock();
        Self::apply(&mut inner, ArchEvent::ForceReadOnly);
        if let Some(consumer) = inner.consumer.take() {
            self.log.unregister_consumer(consumer);
        }
        if let Some(group) = inner.current.take() {
            group.mark_inactive();
        }
        drop(inner);
        warn!("arch.read_only");
        self.progress.notify();
    }

    /// Aborts archiving and joins the background task.
    pub fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::Release);
        {
            let mut inner = self.inner.lock();
            if Self::apply(&mut inner, ArchEvent::Shutdown) {
                if let Some(consumer) = inner.consumer.take() {
                    self.log.unregister_consumer(consumer);
                }
                if let Some(group) = inner.current.take() {
                    group.mark_inactive();
                }
            }
        }
        self.progress.notify();
        self.log.flushed_event().notify();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| LogError::Invalid("archiver thread panicked"))?;
        }
        info!(archived_lsn = self.archived_lsn().0, "arch.shutdown");
        Ok(())
    }
}
