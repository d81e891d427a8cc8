//! Shared helpers for the integration tests: tracing setup, a fault-injecting
//! file provider, a toy keyring and log construction shortcuts.

#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use redolog::log::format::ENCRYPTION_KEY_LEN;
use redolog::log::{DirtyPageTracker, Keyring, LogCollaborators, LogOptions, LogSys};
use redolog::primitives::io::{FileIo, IoProvider, StdIoProvider};
use redolog::{LogError, Lsn, Result};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("redolog=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Switches shared by every file a [`FaultyIoProvider`] opened.
#[derive(Default)]
pub struct Faults {
    /// Every write fails while set.
    pub fail_writes: AtomicBool,
    /// Every fsync fails while set.
    pub fail_sync: AtomicBool,
    /// Writes observed so far.
    pub writes: AtomicU64,
}

/// File provider whose files fail on demand.
#[derive(Clone, Default)]
pub struct FaultyIoProvider {
    pub faults: Arc<Faults>,
    /// When set, only files whose path contains this text are faulty.
    pub only_paths_containing: Option<&'static str>,
}

struct FaultyFile {
    inner: Arc<dyn FileIo>,
    faults: Arc<Faults>,
}

impl FileIo for FaultyFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.faults.writes.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(LogError::Io(io::Error::other("injected write error")));
        }
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        if self.faults.fail_sync.load(Ordering::SeqCst) {
            return Err(LogError::Io(io::Error::other("injected sync error")));
        }
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

impl IoProvider for FaultyIoProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        let inner = StdIoProvider.open(path)?;
        if let Some(needle) = self.only_paths_containing {
            if !path.to_string_lossy().contains(needle) {
                return Ok(inner);
            }
        }
        Ok(Arc::new(FaultyFile {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }
}

/// Keyring xoring keys with the master key id.
#[derive(Default)]
pub struct TestKeyring {
    pub rotations: AtomicU32,
}

impl Keyring for TestKeyring {
    fn current_master_key_id(&self) -> Result<u32> {
        Ok(self.rotations.load(Ordering::SeqCst) + 1)
    }

    fn wrap(&self, master_key_id: u32, key: &[u8; ENCRYPTION_KEY_LEN]) -> Result<[u8; ENCRYPTION_KEY_LEN]> {
        let mut out = *key;
        for byte in out.iter_mut() {
            *byte ^= master_key_id as u8;
        }
        Ok(out)
    }

    fn unwrap(
        &self,
        master_key_id: u32,
        wrapped: &[u8; ENCRYPTION_KEY_LEN],
    ) -> Result<[u8; ENCRYPTION_KEY_LEN]> {
        self.wrap(master_key_id, wrapped)
    }
}

/// Opens a small log in `dir` with checkpoints enabled.
pub fn open_small(dir: &Path) -> (Arc<LogSys>, Arc<DirtyPageTracker>) {
    open_with(LogOptions::small(dir), |collab| collab)
}

/// Opens a log with `opts`, letting the caller adjust the collaborators.
pub fn open_with<F>(opts: LogOptions, adjust: F) -> (Arc<LogSys>, Arc<DirtyPageTracker>)
where
    F: FnOnce(LogCollaborators) -> LogCollaborators,
{
    init_tracing();
    let pool = Arc::new(DirtyPageTracker::new());
    let collab = adjust(LogCollaborators::new(pool.clone()));
    let log = LogSys::open(opts, collab).expect("open log");
    log.enable_checkpoints();
    (log, pool)
}

/// Payload of record `n`, recognizable when read back.
pub fn record(n: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (n as usize * 31 + i) as u8).collect()
}

/// Appends `count` records of `len` bytes, each dirtying one of 16 pages.
/// Returns the lsn range of every record.
pub fn write_records(log: &LogSys, first: u64, count: u64, len: usize) -> Vec<(Lsn, Lsn)> {
    (first..first + count)
        .map(|n| {
            log.free_check().expect("free check");
            log.append(&record(n, len), &[n % 16]).expect("append")
        })
        .collect()
}

/// Reads the payload of a record written at `start`, stripping block framing.
pub fn read_payload(log: &LogSys, start: Lsn, len: usize) -> Vec<u8> {
    use redolog::log::lsn::{advance, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE, LOG_BLOCK_TRL_SIZE};
    let end = advance(start, len as u64);
    let mut framed = vec![0u8; (end.0 - start.0) as usize];
    log.read_log(start, &mut framed).expect("read log");
    let mut out = Vec::with_capacity(len);
    let mut lsn = start.0;
    for byte in framed {
        let in_block = lsn % LOG_BLOCK_SIZE;
        if in_block >= LOG_BLOCK_HDR_SIZE && in_block < LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE {
            out.push(byte);
        }
        lsn += 1;
    }
    out
}

/// Polls `check` until it holds or `timeout` passes.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Flips one bit at `offset` in the file at `path`.
pub fn corrupt_byte_at(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8];
    file.read_exact(&mut byte)?;
    byte[0] ^= 0x01;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}
