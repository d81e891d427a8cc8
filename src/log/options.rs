use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log::capacity::LogCapacity;
use crate::log::format::LOG_FILE_HDR_SIZE;
use crate::log::lsn::LOG_BLOCK_SIZE;
use crate::types::{LogError, Result};

/// Configuration for opening a redo log.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Directory holding the `redo_NNNNNN.log` files.
    pub dir: PathBuf,
    /// Size of each log file in bytes, header region included.
    pub file_size: u64,
    /// Number of files the capacity is planned for.
    pub n_files: u32,
    /// Buffer pool page size, used to size the concurrency margin.
    pub page_size: u32,
    /// Maximum concurrently active writer threads, 0 for unlimited.
    pub thread_concurrency: u32,
    /// Write checkpoints on a timer even without pressure.
    pub periodic_checkpoints: bool,
    /// Interval between periodic checkpoints.
    pub checkpoint_every: Duration,
    /// Longest the checkpointer sleeps between evaluations.
    pub checkpointer_timeout: Duration,
    /// Sleep quantum of the free-check wait.
    pub free_check_sleep: Duration,
    /// Interval between warnings emitted by long waits.
    pub wait_alert_every: Duration,
    /// Keep an encryption header in the log; requires a keyring.
    pub encryption: bool,
    /// Fsync after every append instead of leaving it to the checkpointer.
    pub flush_sync: bool,
    /// Tag written into every file header.
    pub creator: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("redo"),
            file_size: 32 * 1024 * 1024,
            n_files: 8,
            page_size: 16 * 1024,
            thread_concurrency: 32,
            periodic_checkpoints: false,
            checkpoint_every: Duration::from_secs(7),
            checkpointer_timeout: Duration::from_secs(1),
            free_check_sleep: Duration::from_millis(10),
            wait_alert_every: Duration::from_secs(5),
            encryption: false,
            flush_sync: false,
            creator: concat!("redolog ", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl LogOptions {
    /// Defaults rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Tiny files and short timers; cycles through files after a few hundred
    /// kilobytes of log.
    pub fn small(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_size: 64 * 1024,
            n_files: 4,
            page_size: 1024,
            thread_concurrency: 2,
            periodic_checkpoints: false,
            checkpoint_every: Duration::from_millis(100),
            checkpointer_timeout: Duration::from_millis(10),
            free_check_sleep: Duration::from_millis(1),
            wait_alert_every: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Fsyncs every append and checkpoints periodically.
    pub fn durable(dir: impl AsRef<Path>) -> Self {
        Self {
            flush_sync: true,
            periodic_checkpoints: true,
            ..Self::new(dir)
        }
    }

    /// Capacities implied by the file geometry.
    pub fn capacity(&self) -> LogCapacity {
        LogCapacity::new(
            u64::from(self.n_files),
            self.file_size.saturating_sub(LOG_FILE_HDR_SIZE),
        )
    }

    /// Checks the options for values the log cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.file_size % LOG_BLOCK_SIZE != 0 {
            return Err(LogError::Invalid("log file size must be a multiple of 512"));
        }
        if self.file_size < LOG_FILE_HDR_SIZE + 8 * LOG_BLOCK_SIZE {
            return Err(LogError::Invalid("log file size too small"));
        }
        if self.n_files < 2 {
            return Err(LogError::Invalid("at least two log files are required"));
        }
        if !self.page_size.is_power_of_two() || u64::from(self.page_size) < LOG_BLOCK_SIZE {
            return Err(LogError::Invalid(
                "page size must be a power of two of at least 512",
            ));
        }
        if self.checkpointer_timeout.is_zero()
            || self.free_check_sleep.is_zero()
            || self.wait_alert_every.is_zero()
            || self.checkpoint_every.is_zero()
        {
            return Err(LogError::Invalid("log timers must be non-zero"));
        }
        let capacity = self.capacity();
        let (margin, _) = capacity.concurrency_margin(
            u64::from(self.thread_concurrency),
            u64::from(self.page_size),
        );
        if margin >= capacity.soft_logical
            || capacity.free_check_capacity(margin) < LOG_BLOCK_SIZE
        {
            return Err(LogError::Invalid("log capacity too small for its margin"));
        }
        Ok(())
    }
}

/// Configuration of the log archiver.
#[derive(Clone, Debug)]
pub struct ArchiveOptions {
    /// Directory receiving `arch_<uuid>` group directories.
    pub dir: PathBuf,
    /// Size of each archive file, header region included.
    pub file_size: u64,
    /// Largest number of bytes copied per archiver step.
    pub chunk_size: u64,
    /// Sleep of the background task when there is nothing to copy.
    pub background_timeout: Duration,
    /// Interval between warnings emitted by long waits.
    pub wait_alert_every: Duration,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("archive"),
            file_size: 64 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            background_timeout: Duration::from_millis(100),
            wait_alert_every: Duration::from_secs(5),
        }
    }
}

impl ArchiveOptions {
    /// Defaults rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Small files and chunks, for tests and tooling.
    pub fn small(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_size: 32 * 1024,
            chunk_size: 8 * 1024,
            background_timeout: Duration::from_millis(5),
            wait_alert_every: Duration::from_secs(2),
        }
    }

    /// Checks the options.
    pub fn validate(&self) -> Result<()> {
        if self.file_size % LOG_BLOCK_SIZE != 0 || self.file_size <= LOG_FILE_HDR_SIZE {
            return Err(LogError::Invalid(
                "archive file size must be a multiple of 512 above the header",
            ));
        }
        if self.chunk_size < LOG_BLOCK_SIZE {
            return Err(LogError::Invalid("archive chunk must hold a block"));
        }
        if self.background_timeout.is_zero() || self.wait_alert_every.is_zero() {
            return Err(LogError::Invalid("archive timers must be non-zero"));
        }
        Ok(())
    }
}
