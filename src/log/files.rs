//! The set of redo files on disk, guarded by `files_mutex`.
//!
//! Files cover contiguous lsn ranges. A file is consumed (and removed from
//! disk) once neither the checkpoint nor any registered [`LogConsumer`] needs
//! its bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::log::format::{EncryptionBlock, FileHeader, HeaderDescriptor, LOG_FILE_HDR_SIZE};
use crate::log::lsn::LOG_BLOCK_SIZE;
use crate::primitives::io::{FileIo, IoProvider};
use crate::types::{LogError, Lsn, Result};

const FILE_PREFIX: &str = "redo_";
const FILE_SUFFIX: &str = ".log";

/// Something that still needs log bytes from `consumed_lsn()` onwards.
pub trait LogConsumer: Send + Sync {
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
    /// Lowest lsn this consumer still needs.
    fn consumed_lsn(&self) -> Lsn;
}

/// Handle returned by [`LogFileSet::register_consumer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(u64);

/// Path of log file number `id` inside `dir`.
pub fn log_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{id:06}{FILE_SUFFIX}"))
}

/// Parses the id out of a log file name.
pub fn parse_log_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Lists `(id, path)` of every log file in `dir`, ordered by id.
pub fn list_log_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_log_file_name) {
            found.push((id, entry.path()));
        }
    }
    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

/// One log file.
pub struct LogFile {
    /// File number.
    pub id: u64,
    /// First lsn stored in the file.
    pub start_lsn: Lsn,
    /// One past the last lsn stored in the file.
    pub end_lsn: Lsn,
    /// Set once the file may be reclaimed.
    pub consumed: bool,
    io: Arc<dyn FileIo>,
}

impl LogFile {
    /// Handle for positioned I/O.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Whether `lsn` falls inside this file.
    pub fn contains(&self, lsn: Lsn) -> bool {
        self.start_lsn <= lsn && lsn < self.end_lsn
    }

    /// File offset of `lsn`, which must be inside the file.
    pub fn offset_of(&self, lsn: Lsn) -> u64 {
        LOG_FILE_HDR_SIZE + (lsn.0 - self.start_lsn.0)
    }

    fn info(&self) -> LogFileInfo {
        LogFileInfo {
            id: self.id,
            start_lsn: self.start_lsn.0,
            end_lsn: self.end_lsn.0,
            consumed: self.consumed,
        }
    }
}

/// Serializable description of a log file.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct LogFileInfo {
    /// File number.
    pub id: u64,
    /// First lsn in the file.
    pub start_lsn: u64,
    /// One past the last lsn in the file.
    pub end_lsn: u64,
    /// Whether the file was reclaimed.
    pub consumed: bool,
}

/// Log files plus the consumers that hold them back.
pub struct LogFileSet {
    dir: PathBuf,
    file_size: u64,
    log_uuid: Uuid,
    creator: String,
    provider: Arc<dyn IoProvider>,
    files: BTreeMap<u64, LogFile>,
    consumers: BTreeMap<ConsumerId, Arc<dyn LogConsumer>>,
    next_consumer: u64,
    budget: u64,
}

impl LogFileSet {
    /// Creates an empty set rooted at `dir`.
    pub fn new(
        dir: &Path,
        file_size: u64,
        budget: u64,
        log_uuid: Uuid,
        creator: &str,
        provider: Arc<dyn IoProvider>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file_size,
            log_uuid,
            creator: creator.to_owned(),
            provider,
            files: BTreeMap::new(),
            consumers: BTreeMap::new(),
            next_consumer: 1,
            budget,
        }
    }

    /// Loads every existing log file in `dir`. Returns `Ok(None)` when the
    /// directory holds no log.
    pub fn open_existing(
        dir: &Path,
        file_size: u64,
        budget: u64,
        creator: &str,
        provider: Arc<dyn IoProvider>,
    ) -> Result<Option<Self>> {
        let listed = list_log_files(dir)?;
        if listed.is_empty() {
            return Ok(None);
        }
        let mut set: Option<Self> = None;
        for (id, path) in listed {
            let io = provider.open(&path)?;
            let len = io.len()?;
            if len != file_size {
                return Err(LogError::InvalidOwned(format!(
                    "log file {} has size {len}, expected {file_size}",
                    path.display()
                )));
            }
            let mut raw = [0u8; LOG_BLOCK_SIZE as usize];
            io.read_at(0, &mut raw)?;
            let header = FileHeader::decode(&raw)?;
            let target = set.get_or_insert_with(|| {
                Self::new(
                    dir,
                    file_size,
                    budget,
                    header.log_uuid,
                    creator,
                    Arc::clone(&provider),
                )
            });
            if header.log_uuid != target.log_uuid {
                return Err(LogError::Corruption("log files belong to different logs"));
            }
            if let Some(prev) = target.files.values().next_back() {
                if prev.end_lsn != header.start_lsn {
                    return Err(LogError::Corruption("gap between log files"));
                }
            }
            let end_lsn = header.start_lsn + target.data_size();
            target.files.insert(
                id,
                LogFile {
                    id,
                    start_lsn: header.start_lsn,
                    end_lsn,
                    consumed: false,
                    io,
                },
            );
        }
        Ok(set)
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identifier written into every file header.
    pub fn log_uuid(&self) -> Uuid {
        self.log_uuid
    }

    /// Payload bytes per file.
    pub fn data_size(&self) -> u64 {
        self.file_size - LOG_FILE_HDR_SIZE
    }

    /// Files currently on disk, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogFile> {
        self.files.values()
    }

    /// Descriptions of every file on disk.
    pub fn infos(&self) -> Vec<LogFileInfo> {
        self.files.values().map(LogFile::info).collect()
    }

    /// Looks up a file by id.
    pub fn get(&self, id: u64) -> Option<&LogFile> {
        self.files.get(&id)
    }

    /// The file holding `lsn`, if any.
    pub fn find(&self, lsn: Lsn) -> Option<&LogFile> {
        self.files.values().find(|file| file.contains(lsn))
    }

    /// Newest file.
    pub fn newest(&self) -> Option<&LogFile> {
        self.files.values().next_back()
    }

    /// Oldest file still on disk.
    pub fn oldest(&self) -> Option<&LogFile> {
        self.files.values().next()
    }

    /// Creates the next file, starting where the newest one ends or at
    /// `start_lsn` when the set is empty. The header region carries
    /// `checkpoint` in the first slot and `encryption` when given.
    pub fn create_next(
        &mut self,
        start_lsn: Lsn,
        checkpoint: Option<Lsn>,
        encryption: Option<EncryptionBlock>,
    ) -> Result<&LogFile> {
        let (id, start) = match self.files.values().next_back() {
            Some(last) => (last.id + 1, last.end_lsn),
            None => (0, start_lsn),
        };
        debug_assert_eq!(start.0 % LOG_BLOCK_SIZE, 0);
        let path = log_file_path(&self.dir, id);
        let io = self.provider.open(&path)?;
        io.truncate(self.file_size)?;
        let desc = HeaderDescriptor {
            header: FileHeader::new(start, self.log_uuid, &self.creator),
            checkpoint,
            encryption,
        };
        io.write_at(0, &desc.encode())?;
        io.sync_all()?;
        let end_lsn = start + self.data_size();
        info!(id, start_lsn = start.0, end_lsn = end_lsn.0, "log.files.create");
        let on_disk = self.files.len() as u64 + 1;
        if on_disk > self.budget {
            warn!(
                files = on_disk,
                budget = self.budget,
                "log.files.over_budget: a log consumer is holding back reclamation"
            );
        }
        self.files.insert(
            id,
            LogFile {
                id,
                start_lsn: start,
                end_lsn,
                consumed: false,
                io,
            },
        );
        self.files
            .get(&id)
            .ok_or(LogError::Invalid("log file vanished after creation"))
    }

    /// File handles covering `[from, to]`, used to fsync written data.
    pub fn covering(&self, from: Lsn, to: Lsn) -> Vec<Arc<dyn FileIo>> {
        self.files
            .values()
            .filter(|file| file.end_lsn > from && file.start_lsn <= to)
            .map(|file| Arc::clone(&file.io))
            .collect()
    }

    /// Registers a consumer; files it still needs are kept.
    pub fn register_consumer(&mut self, consumer: Arc<dyn LogConsumer>) -> ConsumerId {
        let id = ConsumerId(self.next_consumer);
        self.next_consumer += 1;
        debug!(
            consumer = consumer.name(),
            consumed_lsn = consumer.consumed_lsn().0,
            "log.files.register_consumer"
        );
        self.consumers.insert(id, consumer);
        id
    }

    /// Removes a consumer registered earlier.
    pub fn unregister_consumer(&mut self, id: ConsumerId) {
        if let Some(consumer) = self.consumers.remove(&id) {
            debug!(consumer = consumer.name(), "log.files.unregister_consumer");
        }
    }

    /// Lowest lsn still needed by the checkpoint or any consumer.
    pub fn min_consumed_lsn(&self, checkpoint_lsn: Lsn) -> Lsn {
        self.consumers
            .values()
            .map(|consumer| consumer.consumed_lsn())
            .fold(checkpoint_lsn, Lsn::min)
    }

    /// Consumes and deletes every file whose bytes all lie below the lowest
    /// needed lsn. The file holding `write_lsn` is never consumed.
    pub fn consume(&mut self, checkpoint_lsn: Lsn, write_lsn: Lsn) -> Result<Vec<LogFileInfo>> {
        let upto = self.min_consumed_lsn(checkpoint_lsn);
        let victims: Vec<u64> = self
            .files
            .values()
            .filter(|file| file.end_lsn <= upto && !file.contains(write_lsn))
            .map(|file| file.id)
            .collect();
        let mut consumed = Vec::with_capacity(victims.len());
        for id in victims {
            if let Some(file) = self.files.get_mut(&id) {
                file.consumed = true;
                consumed.push(file.info());
            }
            self.provider.remove(&log_file_path(&self.dir, id))?;
            self.files.remove(&id);
            debug!(id, upto = upto.0, "log.files.consume");
        }
        Ok(consumed)
    }
}
