//! On-disk layout of log file headers, checkpoint slots, the encryption block
//! and data block framing.
//!
//! Every log file (and every archive file) starts with a 2048-byte header
//! region made of four 512-byte blocks:
//!
//! | offset | block                   |
//! |--------|-------------------------|
//! | 0      | file header             |
//! | 512    | checkpoint slot 1       |
//! | 1024   | encryption info         |
//! | 1536   | checkpoint slot 2       |
//!
//! Each block ends with a crc32 seeded by its block index.

use uuid::Uuid;

use crate::log::lsn::{LOG_BLOCK_HDR_SIZE, LOG_BLOCK_SIZE, LOG_BLOCK_TRL_SIZE};
use crate::types::{block_crc32, LogError, Lsn, Result};

/// Size of the header region at the start of every log and archive file.
pub const LOG_FILE_HDR_SIZE: u64 = 4 * LOG_BLOCK_SIZE;
/// Offset of the encryption info block.
pub const ENCRYPTION_OFFSET: u64 = 2 * LOG_BLOCK_SIZE;
/// Current header format version.
pub const LOG_FORMAT_VERSION: u32 = 1;

const FILE_MAGIC: [u8; 4] = *b"RDLF";
const ENCRYPTION_MAGIC: [u8; 4] = *b"lRE1";
const CREATOR_LEN: usize = 32;
const BLOCK: usize = LOG_BLOCK_SIZE as usize;
const CRC_AT: usize = BLOCK - LOG_BLOCK_TRL_SIZE as usize;
const ENCRYPTION_FLAG_WRAPPED: u32 = 1;

/// Length of the key and iv stored in the encryption block.
pub const ENCRYPTION_KEY_LEN: usize = 32;

fn be_u16(src: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&src[at..at + 2]);
    u16::from_be_bytes(raw)
}

fn be_u32(src: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn be_u64(src: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(raw)
}

fn seal(block_index: u64, buf: &mut [u8]) {
    let crc = block_crc32(block_index, &buf[..CRC_AT]);
    buf[CRC_AT..BLOCK].copy_from_slice(&crc.to_be_bytes());
}

fn verify(block_index: u64, buf: &[u8], what: &'static str) -> Result<()> {
    if buf.len() < BLOCK {
        return Err(LogError::Corruption(what));
    }
    if be_u32(buf, CRC_AT) != block_crc32(block_index, &buf[..CRC_AT]) {
        return Err(LogError::Corruption(what));
    }
    Ok(())
}

/// One of the two alternating checkpoint header slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum HeaderSlot {
    /// Slot at offset 512.
    First,
    /// Slot at offset 1536.
    Second,
}

impl HeaderSlot {
    /// Byte offset of the slot in the file.
    pub const fn offset(self) -> u64 {
        match self {
            HeaderSlot::First => LOG_BLOCK_SIZE,
            HeaderSlot::Second => 3 * LOG_BLOCK_SIZE,
        }
    }

    /// The slot that is not `self`.
    pub const fn other(self) -> HeaderSlot {
        match self {
            HeaderSlot::First => HeaderSlot::Second,
            HeaderSlot::Second => HeaderSlot::First,
        }
    }

    const fn block_index(self) -> u64 {
        self.offset() / LOG_BLOCK_SIZE
    }

    /// Both slots in on-disk order.
    pub const ALL: [HeaderSlot; 2] = [HeaderSlot::First, HeaderSlot::Second];
}

/// Identity block at the start of each file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub format: u32,
    /// First lsn stored in this file.
    pub start_lsn: Lsn,
    /// Identifier shared by every file of one log (or archive group).
    pub log_uuid: Uuid,
    /// Free-form tag naming the software that created the file.
    pub creator: String,
}

impl FileHeader {
    /// Header for a new file at `start_lsn`.
    pub fn new(start_lsn: Lsn, log_uuid: Uuid, creator: &str) -> Self {
        Self {
            format: LOG_FORMAT_VERSION,
            start_lsn,
            log_uuid,
            creator: creator.to_owned(),
        }
    }

    /// Encodes the header into a full block.
    pub fn encode(&self) -> [u8; BLOCK] {
        let mut buf = [0u8; BLOCK];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4..8].copy_from_slice(&self.format.to_be_bytes());
        buf[8..16].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        buf[16..32].copy_from_slice(self.log_uuid.as_bytes());
        let creator = self.creator.as_bytes();
        let len = creator.len().min(CREATOR_LEN);
        buf[32..32 + len].copy_from_slice(&creator[..len]);
        seal(0, &mut buf);
        buf
    }

    /// Decodes and validates a header block.
    pub fn decode(src: &[u8]) -> Result<Self> {
        verify(0, src, "log file header crc mismatch")?;
        if src[0..4] != FILE_MAGIC {
            return Err(LogError::Corruption("log file magic mismatch"));
        }
        let format = be_u32(src, 4);
        if format != LOG_FORMAT_VERSION {
            return Err(LogError::Corruption("log file format version mismatch"));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&src[16..32]);
        let creator_raw = &src[32..32 + CREATOR_LEN];
        let end = creator_raw
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(CREATOR_LEN);
        Ok(Self {
            format,
            start_lsn: Lsn(be_u64(src, 8)),
            log_uuid: Uuid::from_bytes(uuid),
            creator: String::from_utf8_lossy(&creator_raw[..end]).into_owned(),
        })
    }
}

/// Contents of one checkpoint slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Lsn recovery starts from.
    pub checkpoint_lsn: Lsn,
}

impl CheckpointHeader {
    /// Encodes the slot for `slot`.
    pub fn encode(&self, slot: HeaderSlot) -> [u8; BLOCK] {
        let mut buf = [0u8; BLOCK];
        buf[0..8].copy_from_slice(&self.checkpoint_lsn.0.to_be_bytes());
        seal(slot.block_index(), &mut buf);
        buf
    }

    /// Decodes a slot. A never-written (all zero) slot yields `Ok(None)`; a slot
    /// that fails its checksum is reported as corruption.
    pub fn decode(slot: HeaderSlot, src: &[u8]) -> Result<Option<Self>> {
        if src.iter().take(BLOCK).all(|b| *b == 0) {
            return Ok(None);
        }
        verify(slot.block_index(), src, "checkpoint header crc mismatch")?;
        Ok(Some(Self {
            checkpoint_lsn: Lsn(be_u64(src, 0)),
        }))
    }
}

/// Serialized redo encryption info.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionBlock {
    /// Id of the master key that wrapped `key`, 0 when stored unwrapped.
    pub master_key_id: u32,
    /// Identity of the server that owns the master key.
    pub server_uuid: Uuid,
    /// Tablespace key, wrapped when `wrapped` is set.
    pub key: [u8; ENCRYPTION_KEY_LEN],
    /// Initialization vector.
    pub iv: [u8; ENCRYPTION_KEY_LEN],
    /// Whether `key` is wrapped with the master key.
    pub wrapped: bool,
}

impl std::fmt::Debug for EncryptionBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionBlock")
            .field("master_key_id", &self.master_key_id)
            .field("server_uuid", &self.server_uuid)
            .field("wrapped", &self.wrapped)
            .finish_non_exhaustive()
    }
}

impl EncryptionBlock {
    const BLOCK_INDEX: u64 = ENCRYPTION_OFFSET / LOG_BLOCK_SIZE;

    /// Encodes the info into a full block.
    pub fn encode(&self) -> [u8; BLOCK] {
        let mut buf = [0u8; BLOCK];
        let flags = if self.wrapped {
            ENCRYPTION_FLAG_WRAPPED
        } else {
            0
        };
        buf[0..4].copy_from_slice(&ENCRYPTION_MAGIC);
        buf[4..8].copy_from_slice(&flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.master_key_id.to_be_bytes());
        buf[12..28].copy_from_slice(self.server_uuid.as_bytes());
        buf[28..60].copy_from_slice(&self.key);
        buf[60..92].copy_from_slice(&self.iv);
        seal(Self::BLOCK_INDEX, &mut buf);
        buf
    }

    /// Decodes the block; `Ok(None)` means the file is not encrypted.
    pub fn decode(src: &[u8]) -> Result<Option<Self>> {
        if src.iter().take(BLOCK).all(|b| *b == 0) {
            return Ok(None);
        }
        verify(Self::BLOCK_INDEX, src, "encryption info crc mismatch")?;
        if src[0..4] != ENCRYPTION_MAGIC {
            return Err(LogError::Corruption("encryption info magic mismatch"));
        }
        let flags = be_u32(src, 4);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&src[12..28]);
        let mut key = [0u8; ENCRYPTION_KEY_LEN];
        key.copy_from_slice(&src[28..60]);
        let mut iv = [0u8; ENCRYPTION_KEY_LEN];
        iv.copy_from_slice(&src[60..92]);
        Ok(Some(Self {
            master_key_id: be_u32(src, 8),
            server_uuid: Uuid::from_bytes(uuid),
            key,
            iv,
            wrapped: flags & ENCRYPTION_FLAG_WRAPPED != 0,
        }))
    }
}

/// Describes the header region to write at the start of a new file.
///
/// Log files carry no checkpoint when created; archive files record the
/// anchor lsn of their group in the first slot.
#[derive(Clone, Debug)]
pub struct HeaderDescriptor {
    /// File identity.
    pub header: FileHeader,
    /// Lsn to store in the first checkpoint slot.
    pub checkpoint: Option<Lsn>,
    /// Encryption info to store, if the log is encrypted.
    pub encryption: Option<EncryptionBlock>,
}

impl HeaderDescriptor {
    /// Encodes the full header region.
    pub fn encode(&self) -> Vec<u8> {
        let mut region = vec![0u8; LOG_FILE_HDR_SIZE as usize];
        region[..BLOCK].copy_from_slice(&self.header.encode());
        if let Some(lsn) = self.checkpoint {
            let slot = HeaderSlot::First;
            let at = slot.offset() as usize;
            region[at..at + BLOCK].copy_from_slice(
                &CheckpointHeader {
                    checkpoint_lsn: lsn,
                }
                .encode(slot),
            );
        }
        if let Some(encryption) = &self.encryption {
            let at = ENCRYPTION_OFFSET as usize;
            region[at..at + BLOCK].copy_from_slice(&encryption.encode());
        }
        region
    }
}

/// Framing of a data block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Low 32 bits of the block number.
    pub block_no: u32,
    /// Bytes used in the block, header included.
    pub data_len: u16,
    /// Offset of the first record that starts in this block, 0 if none.
    pub first_rec_group: u16,
}

impl BlockHeader {
    /// Writes the header and trailer checksum into `block`.
    pub fn seal(&self, block: &mut [u8]) {
        block[0..4].copy_from_slice(&self.block_no.to_be_bytes());
        block[4..6].copy_from_slice(&self.data_len.to_be_bytes());
        block[6..8].copy_from_slice(&self.first_rec_group.to_be_bytes());
        block[8..LOG_BLOCK_HDR_SIZE as usize].fill(0);
        seal(u64::from(self.block_no), block);
    }

    /// Reads and checks the framing of `block`, which must be block number
    /// `expected_no`.
    pub fn decode(expected_no: u64, block: &[u8]) -> Result<Self> {
        if block.len() < BLOCK {
            return Err(LogError::Corruption("log block truncated"));
        }
        let header = Self {
            block_no: be_u32(block, 0),
            data_len: be_u16(block, 4),
            first_rec_group: be_u16(block, 6),
        };
        if u64::from(header.block_no) != expected_no & u64::from(u32::MAX) {
            return Err(LogError::Corruption("log block number mismatch"));
        }
        verify(u64::from(header.block_no), block, "log block crc mismatch")?;
        if u64::from(header.data_len) < LOG_BLOCK_HDR_SIZE
            || u64::from(header.data_len) > LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE
        {
            return Err(LogError::Corruption("log block data length out of range"));
        }
        Ok(header)
    }
}
