//! One archiver group: the files receiving a contiguous range of the log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::log::format::{EncryptionBlock, FileHeader, HeaderDescriptor, LOG_FILE_HDR_SIZE};
use crate::log::lsn::{LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE};
use crate::primitives::io::{FileIo, IoProvider};
use crate::types::{LogError, Lsn, Result};

const GROUP_PREFIX: &str = "arch_";
const FILE_PREFIX: &str = "ib_log_";

/// Directory of the group `uuid` inside `root`.
pub fn group_dir(root: &Path, uuid: Uuid) -> PathBuf {
    root.join(format!("{GROUP_PREFIX}{uuid}"))
}

/// Path of archive file `index` inside a group directory.
pub fn archive_file_path(group_dir: &Path, index: u64) -> PathBuf {
    group_dir.join(format!("{FILE_PREFIX}{index}"))
}

/// Parses the index out of an archive file name.
pub fn parse_archive_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?.parse().ok()
}

/// Parses the group uuid out of a group directory name.
pub fn parse_group_dir_name(name: &str) -> Option<Uuid> {
    name.strip_prefix(GROUP_PREFIX)?.parse().ok()
}

/// Placement of one archive file.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ArchFileInfo {
    /// File index inside the group.
    pub index: u64,
    /// Path on disk.
    pub path: PathBuf,
    /// First lsn the file can hold.
    pub start_lsn: Lsn,
    /// One past the last lsn the file can hold.
    pub end_lsn: Lsn,
}

struct GroupInner {
    end_lsn: Lsn,
    attached: u32,
    refs: u32,
    ever_durable: bool,
    active: bool,
    files: BTreeMap<u64, Arc<dyn FileIo>>,
}

/// Everything needed to lay out a new group.
pub(crate) struct GroupSpec<'a> {
    pub(crate) root: &'a Path,
    pub(crate) file_size: u64,
    pub(crate) begin_lsn: Lsn,
    pub(crate) anchor_lsn: Lsn,
    pub(crate) log_uuid: Uuid,
    pub(crate) creator: &'a str,
    pub(crate) encryption: Option<EncryptionBlock>,
    pub(crate) durable: bool,
    pub(crate) io: Arc<dyn IoProvider>,
}

/// Files of one archiving session, shared by every client that attached to it.
pub struct ArchGroup {
    uuid: Uuid,
    begin_lsn: Lsn,
    anchor_lsn: Lsn,
    dir: PathBuf,
    file_size: u64,
    log_uuid: Uuid,
    creator: String,
    encryption: Option<EncryptionBlock>,
    io: Arc<dyn IoProvider>,
    inner: Mutex<GroupInner>,
}

impl ArchGroup {
    /// Creates the group directory and its first file, synchronously, with
    /// one attached client.
    pub(crate) fn create(spec: GroupSpec<'_>) -> Result<Arc<Self>> {
        let uuid = Uuid::new_v4();
        let dir = group_dir(spec.root, uuid);
        std::fs::create_dir_all(&dir)?;
        let group = Arc::new(Self {
            uuid,
            begin_lsn: spec.begin_lsn,
            anchor_lsn: spec.anchor_lsn,
            dir,
            file_size: spec.file_size,
            log_uuid: spec.log_uuid,
            creator: spec.creator.to_owned(),
            encryption: spec.encryption,
            io: spec.io,
            inner: Mutex::new(GroupInner {
                end_lsn: Lsn::ZERO,
                attached: 1,
                refs: 1,
                ever_durable: spec.durable,
                active: true,
                files: BTreeMap::new(),
            }),
        });
        {
            let mut inner = group.inner.lock();
            group.ensure_file(&mut inner, 0)?;
        }
        info!(
            group = %uuid,
            begin_lsn = spec.begin_lsn.0,
            durable = spec.durable,
            "arch.group.create"
        );
        Ok(group)
    }

    /// Group identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// First lsn of the group; block aligned.
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// Lsn where archiving stopped, zero while active.
    pub fn end_lsn(&self) -> Lsn {
        self.inner.lock().end_lsn
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True while the archiver is still copying into the group.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Payload bytes per archive file.
    pub fn data_size(&self) -> u64 {
        self.file_size - LOG_FILE_HDR_SIZE
    }

    fn file_start(&self, index: u64) -> Lsn {
        self.begin_lsn + index * self.data_size()
    }

    fn header_for(&self, index: u64) -> HeaderDescriptor {
        let start = self.file_start(index);
        let checkpoint = if index == 0 {
            self.anchor_lsn
        } else {
            start + LOG_BLOCK_HDR_SIZE
        };
        HeaderDescriptor {
            header: FileHeader::new(start, self.log_uuid, &self.creator),
            checkpoint: Some(checkpoint),
            encryption: self.encryption.clone(),
        }
    }

    /// Header region a client writes in front of the data it copies,
    /// anchored at its own start.
    pub fn client_header(&self, begin_lsn: Lsn, anchor_lsn: Lsn) -> Vec<u8> {
        HeaderDescriptor {
            header: FileHeader::new(begin_lsn, self.log_uuid, &self.creator),
            checkpoint: Some(anchor_lsn),
            encryption: self.encryption.clone(),
        }
        .encode()
    }

    fn ensure_file(&self, inner: &mut GroupInner, index: u64) -> Result<Arc<dyn FileIo>> {
        if let Some(io) = inner.files.get(&index) {
            return Ok(Arc::clone(io));
        }
        let path = archive_file_path(&self.dir, index);
        let io = self.io.open(&path)?;
        io.truncate(self.file_size)?;
        io.write_at(0, &self.header_for(index).encode())?;
        io.sync_all()?;
        debug!(group = %self.uuid, index, "arch.group.file_create");
        inner.files.insert(index, Arc::clone(&io));
        Ok(io)
    }

    /// Stores `data`, which belongs at `lsn`, spanning files as needed.
    pub(crate) fn write(&self, lsn: Lsn, data: &[u8]) -> Result<()> {
        if lsn < self.begin_lsn {
            return Err(LogError::Invalid("archive write before group start"));
        }
        debug_assert_eq!(lsn.0 % LOG_BLOCK_SIZE, 0);
        let mut inner = self.inner.lock();
        let mut pos = lsn;
        let mut rest = data;
        while !rest.is_empty() {
            let index = pos.saturating_since(self.begin_lsn) / self.data_size();
            let start = self.file_start(index);
            let room = (start + self.data_size()).saturating_since(pos) as usize;
            let n = room.min(rest.len());
            let io = self.ensure_file(&mut inner, index)?;
            io.write_at(LOG_FILE_HDR_SIZE + pos.saturating_since(start), &rest[..n])?;
            rest = &rest[n..];
            pos = pos + n as u64;
        }
        Ok(())
    }

    /// Fsyncs every file of the group.
    pub(crate) fn sync(&self) -> Result<()> {
        let files: Vec<Arc<dyn FileIo>> = self.inner.lock().files.values().cloned().collect();
        for io in files {
            io.sync_all()?;
        }
        Ok(())
    }

    /// Files created so far.
    pub fn files(&self) -> Vec<ArchFileInfo> {
        let inner = self.inner.lock();
        inner
            .files
            .keys()
            .map(|&index| {
                let start_lsn = self.file_start(index);
                ArchFileInfo {
                    index,
                    path: archive_file_path(&self.dir, index),
                    start_lsn,
                    end_lsn: start_lsn + self.data_size(),
                }
            })
            .collect()
    }

    pub(crate) fn attach(&self, durable: bool) {
        let mut inner = self.inner.lock();
        inner.attached += 1;
        inner.refs += 1;
        inner.ever_durable |= durable;
    }

    /// Detaches one client. Returns the number of clients still attached.
    pub(crate) fn detach(&self, end_lsn: Lsn) -> u32 {
        let mut inner = self.inner.lock();
        inner.attached = inner.attached.saturating_sub(1);
        inner.end_lsn = inner.end_lsn.max(end_lsn);
        inner.attached
    }

    pub(crate) fn is_unreferenced(&self) -> bool {
        self.inner.lock().refs == 0
    }

    pub(crate) fn mark_inactive(&self) {
        self.inner.lock().active = false;
    }

    /// Drops one reference. Returns true when the group is no longer
    /// referenced nor active and may be destroyed.
    pub(crate) fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.refs = inner.refs.saturating_sub(1);
        inner.refs == 0 && !inner.active
    }

    /// Closes the files and removes them unless a durable client ever held
    /// the group.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.lock();
        let files = std::mem::take(&mut inner.files);
        if inner.ever_durable {
            info!(group = %self.uuid, "arch.group.retain_durable");
            return;
        }
        for index in files.keys() {
            if let Err(err) = self.io.remove(&archive_file_path(&self.dir, *index)) {
                warn!(group = %self.uuid, index, error = %err, "arch.group.remove_failed");
            }
        }
        if let Err(err) = std::fs::remove_dir(&self.dir) {
            warn!(group = %self.uuid, error = %err, "arch.group.remove_dir_failed");
        }
        info!(group = %self.uuid, "arch.group.destroy");
    }
}
