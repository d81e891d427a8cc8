#![forbid(unsafe_code)]

//! Positioned file access for log and archive files.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::types::{LogError, Result};

/// Positioned reads and writes on one open file. Implementations must be
/// safe to call from several threads at once.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from offset `off`; a short file is an `UnexpectedEof` error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at offset `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Fsyncs data and metadata.
    fn sync_all(&self) -> Result<()>;
    /// File length in bytes.
    fn len(&self) -> Result<u64>;
    /// Sets the file length, zero-filling any extension.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// Opens files on behalf of the log and archive file sets.
///
/// The file sets never call `std::fs` for data files directly so that tests can
/// substitute an implementation that fails on demand.
pub trait IoProvider: Send + Sync + 'static {
    /// Opens (creating if needed) a file for positioned read/write access.
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>>;
    /// Removes a file that is no longer referenced. A missing file is fine.
    fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LogError::from(err)),
        }
    }
}

/// [`IoProvider`] backed by [`StdFileIo`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StdIoProvider;

impl IoProvider for StdIoProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open(path)?))
    }
}

/// [`IoProvider`] that opens existing files read-only and refuses removal.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOnlyIoProvider;

impl IoProvider for ReadOnlyIoProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open_read_only(path)?))
    }

    fn remove(&self, _path: &Path) -> Result<()> {
        Err(LogError::ReadOnly)
    }
}

#[cfg(unix)]
mod positioned {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub(super) fn read_exact(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
        file.read_exact_at(dst, off)
    }

    pub(super) fn write_all(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
        file.write_all_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub(super) fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            match file.seek_read(dst, off)? {
                0 => return Err(io::Error::new(ErrorKind::UnexpectedEof, "log file ended early")),
                n => {
                    dst = &mut dst[n..];
                    off += n as u64;
                }
            }
        }
        Ok(())
    }

    pub(super) fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            match file.seek_write(src, off)? {
                0 => return Err(io::Error::new(ErrorKind::WriteZero, "log file write stalled")),
                n => {
                    src = &src[n..];
                    off += n as u64;
                }
            }
        }
        Ok(())
    }
}

/// [`FileIo`] over a shared [`File`] handle.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Opens an existing file read-only; used by inspection tooling.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        Ok(positioned::read_exact(&self.file, off, dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        Ok(positioned::write_all(&self.file, off, src)?)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}
