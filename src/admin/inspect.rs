use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::admin::error::ensure_dir;
use crate::admin::{AdminError, Result};
use crate::archive::{parse_archive_file_name, parse_group_dir_name};
use crate::log::files::list_log_files;
use crate::log::format::{CheckpointHeader, EncryptionBlock, FileHeader, HeaderSlot, ENCRYPTION_OFFSET};
use crate::log::lsn::LOG_BLOCK_SIZE;
use crate::log::{recover_checkpoint, LogFileSet};
use crate::primitives::io::{FileIo, IoProvider, ReadOnlyIoProvider};

const BLOCK: usize = LOG_BLOCK_SIZE as usize;

/// Decoded file header.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderReport {
    /// Format version.
    pub format: u32,
    /// First lsn stored in the file.
    pub start_lsn: u64,
    /// Log identifier.
    pub log_uuid: String,
    /// Creator tag.
    pub creator: String,
}

/// One checkpoint slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    /// Which slot.
    pub slot: HeaderSlot,
    /// Checkpoint lsn, absent for an empty or invalid slot.
    pub checkpoint_lsn: Option<u64>,
    /// Decoding error for a torn slot.
    pub error: Option<String>,
}

/// Encryption block summary; key material is never reported.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptionReport {
    /// Master key the key is wrapped with.
    pub master_key_id: u32,
    /// Server that wrote the block.
    pub server_uuid: String,
    /// Whether the key is wrapped.
    pub wrapped: bool,
}

/// Everything found in one log file's header region.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    /// File number.
    pub id: u64,
    /// Path on disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Decoded header.
    pub header: Option<HeaderReport>,
    /// Header decoding error.
    pub header_error: Option<String>,
    /// Both checkpoint slots.
    pub slots: Vec<SlotReport>,
    /// Encryption block, if present.
    pub encryption: Option<EncryptionReport>,
    /// Encryption block decoding error.
    pub encryption_error: Option<String>,
}

/// Report of [`inspect`].
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    /// Inspected directory.
    pub dir: PathBuf,
    /// Log files, by id.
    pub files: Vec<FileReport>,
}

/// Checkpoint recovery would start from.
#[derive(Debug, Clone, Serialize)]
pub struct RecoverReport {
    /// Inspected directory.
    pub dir: PathBuf,
    /// Checkpoint lsn.
    pub checkpoint_lsn: u64,
    /// File holding it.
    pub file_id: u64,
    /// Slot holding it.
    pub slot: HeaderSlot,
    /// Number of log files.
    pub files: usize,
}

/// One archive file.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveFileReport {
    /// File index in the group.
    pub index: u64,
    /// Path on disk.
    pub path: PathBuf,
    /// First lsn the file holds.
    pub start_lsn: Option<u64>,
    /// Anchor lsn stored in the first checkpoint slot.
    pub anchor_lsn: Option<u64>,
}

/// One archive group directory.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveGroupReport {
    /// Group uuid.
    pub uuid: String,
    /// Files, by index.
    pub files: Vec<ArchiveFileReport>,
}

/// Report of [`archive_files`].
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveFilesReport {
    /// Inspected directory.
    pub dir: PathBuf,
    /// Groups found.
    pub groups: Vec<ArchiveGroupReport>,
}

fn read_block(io: &dyn FileIo, offset: u64) -> std::result::Result<[u8; BLOCK], String> {
    let mut raw = [0u8; BLOCK];
    io.read_at(offset, &mut raw).map_err(|err| err.to_string())?;
    Ok(raw)
}

fn header_report(header: FileHeader) -> HeaderReport {
    HeaderReport {
        format: header.format,
        start_lsn: header.start_lsn.0,
        log_uuid: header.log_uuid.to_string(),
        creator: header.creator,
    }
}

fn encryption_report(block: EncryptionBlock) -> EncryptionReport {
    EncryptionReport {
        master_key_id: block.master_key_id,
        server_uuid: block.server_uuid.to_string(),
        wrapped: block.wrapped,
    }
}

fn inspect_file(id: u64, path: PathBuf) -> Result<FileReport> {
    let io = ReadOnlyIoProvider.open(&path)?;
    let size = io.len()?;
    let mut report = FileReport {
        id,
        path,
        size,
        header: None,
        header_error: None,
        slots: Vec::new(),
        encryption: None,
        encryption_error: None,
    };
    match read_block(io.as_ref(), 0)
        .and_then(|raw| FileHeader::decode(&raw).map_err(|e| e.to_string()))
    {
        Ok(header) => report.header = Some(header_report(header)),
        Err(err) => report.header_error = Some(err),
    }
    for slot in HeaderSlot::ALL {
        let decoded = read_block(io.as_ref(), slot.offset())
            .and_then(|raw| CheckpointHeader::decode(slot, &raw).map_err(|e| e.to_string()));
        report.slots.push(match decoded {
            Ok(found) => SlotReport {
                slot,
                checkpoint_lsn: found.map(|h| h.checkpoint_lsn.0),
                error: None,
            },
            Err(err) => SlotReport {
                slot,
                checkpoint_lsn: None,
                error: Some(err),
            },
        });
    }
    match read_block(io.as_ref(), ENCRYPTION_OFFSET)
        .and_then(|raw| EncryptionBlock::decode(&raw).map_err(|e| e.to_string()))
    {
        Ok(block) => report.encryption = block.map(encryption_report),
        Err(err) => report.encryption_error = Some(err),
    }
    Ok(report)
}

/// Decodes the header region of every log file in `dir` without modifying
/// anything.
///
/// # Errors
///
/// Returns an error if `dir` holds no log files or a file cannot be opened.
pub fn inspect(dir: impl AsRef<Path>) -> Result<InspectReport> {
    let dir = dir.as_ref();
    ensure_dir(dir)?;
    let listed = list_log_files(dir)?;
    if listed.is_empty() {
        return Err(AdminError::missing_log(dir));
    }
    let files = listed
        .into_iter()
        .map(|(id, path)| inspect_file(id, path))
        .collect::<Result<Vec<_>>>()?;
    Ok(InspectReport {
        dir: dir.to_path_buf(),
        files,
    })
}

/// Reports the checkpoint recovery would pick, reading the files read-only.
///
/// # Errors
///
/// Returns an error if the files are inconsistent or carry no valid
/// checkpoint.
pub fn recover(dir: impl AsRef<Path>) -> Result<RecoverReport> {
    let dir = dir.as_ref();
    ensure_dir(dir)?;
    let listed = list_log_files(dir)?;
    let Some((_, first)) = listed.first() else {
        return Err(AdminError::missing_log(dir));
    };
    let file_size = std::fs::metadata(first)?.len();
    let provider: Arc<dyn IoProvider> = Arc::new(ReadOnlyIoProvider);
    let files = LogFileSet::open_existing(dir, file_size, listed.len() as u64, "inspect", provider)?
        .ok_or_else(|| AdminError::missing_log(dir))?;
    let found = recover_checkpoint(&files)?;
    Ok(RecoverReport {
        dir: dir.to_path_buf(),
        checkpoint_lsn: found.checkpoint_lsn.0,
        file_id: found.file_id,
        slot: found.slot,
        files: listed.len(),
    })
}

/// Lists archive groups under `dir` with the lsn each file starts at and the
/// anchor lsn in its header.
///
/// # Errors
///
/// Returns an error if `dir` cannot be read.
pub fn archive_files(dir: impl AsRef<Path>) -> Result<ArchiveFilesReport> {
    let dir = dir.as_ref();
    ensure_dir(dir)?;
    let mut groups = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(uuid) = entry.file_name().to_str().and_then(parse_group_dir_name) else {
            continue;
        };
        let mut files = Vec::new();
        for file in std::fs::read_dir(entry.path())? {
            let file = file?;
            let Some(index) = file.file_name().to_str().and_then(parse_archive_file_name) else {
                continue;
            };
            let path = file.path();
            let io = ReadOnlyIoProvider.open(&path)?;
            let start_lsn = read_block(io.as_ref(), 0)
                .ok()
                .and_then(|raw| FileHeader::decode(&raw).ok())
                .map(|h| h.start_lsn.0);
            let slot = HeaderSlot::First;
            let anchor_lsn = read_block(io.as_ref(), slot.offset())
                .ok()
                .and_then(|raw| CheckpointHeader::decode(slot, &raw).ok().flatten())
                .map(|h| h.checkpoint_lsn.0);
            files.push(ArchiveFileReport {
                index,
                path,
                start_lsn,
                anchor_lsn,
            });
        }
        files.sort_by_key(|f| f.index);
        groups.push(ArchiveGroupReport {
            uuid: uuid.to_string(),
            files,
        });
    }
    groups.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(ArchiveFilesReport {
        dir: dir.to_path_buf(),
        groups,
    })
}
