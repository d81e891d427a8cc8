//! Redo encryption metadata kept in the header region of the checkpoint file.
//!
//! Only the metadata contract lives here: key material is generated, wrapped
//! with the master key of a [`Keyring`], and persisted at a fixed offset so
//! that recovery can find it. The block is rewritten whenever the checkpoint
//! moves into another file and copied into every newly created file.

use parking_lot::MutexGuard;
use rand::{rngs::OsRng, RngCore};
use tracing::info;
use uuid::Uuid;

use crate::log::files::LogFileSet;
use crate::log::format::{EncryptionBlock, ENCRYPTION_KEY_LEN, ENCRYPTION_OFFSET};
use crate::log::lsn::LOG_BLOCK_SIZE;
use crate::log::sys::{LogSys, WriterState};
use crate::types::{LogError, Result};

/// Key management service holding the master key.
pub trait Keyring: Send + Sync {
    /// Id of the master key new metadata is wrapped with.
    fn current_master_key_id(&self) -> Result<u32>;
    /// Wraps `key` with master key `master_key_id`.
    fn wrap(
        &self,
        master_key_id: u32,
        key: &[u8; ENCRYPTION_KEY_LEN],
    ) -> Result<[u8; ENCRYPTION_KEY_LEN]>;
    /// Reverses [`Keyring::wrap`].
    fn unwrap(
        &self,
        master_key_id: u32,
        wrapped: &[u8; ENCRYPTION_KEY_LEN],
    ) -> Result<[u8; ENCRYPTION_KEY_LEN]>;
}

/// Plain key material of the redo log.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionMetadata {
    /// Tablespace key.
    pub key: [u8; ENCRYPTION_KEY_LEN],
    /// Initialization vector.
    pub iv: [u8; ENCRYPTION_KEY_LEN],
}

impl std::fmt::Debug for EncryptionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionMetadata { .. }")
    }
}

impl EncryptionMetadata {
    /// Fresh random key and iv.
    pub fn generate() -> Self {
        let mut key = [0u8; ENCRYPTION_KEY_LEN];
        let mut iv = [0u8; ENCRYPTION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }
}

/// Metadata together with the block it was last persisted as.
#[derive(Clone, Debug)]
pub(crate) struct EncryptionState {
    pub(crate) metadata: EncryptionMetadata,
    pub(crate) block: EncryptionBlock,
}

/// Serializes `metadata`, wrapping the key with the current master key when
/// `wrap` is set.
pub(crate) fn encode_metadata(
    keyring: Option<&dyn Keyring>,
    server_uuid: Uuid,
    metadata: &EncryptionMetadata,
    wrap: bool,
) -> Result<EncryptionBlock> {
    let (master_key_id, key) = if wrap {
        let keyring = keyring.ok_or(LogError::KeyringUnavailable)?;
        let id = keyring.current_master_key_id()?;
        (id, keyring.wrap(id, &metadata.key)?)
    } else {
        (0, metadata.key)
    };
    Ok(EncryptionBlock {
        master_key_id,
        server_uuid,
        key,
        iv: metadata.iv,
        wrapped: wrap,
    })
}

/// Recovers plain metadata from a persisted block.
pub(crate) fn decode_metadata(
    keyring: Option<&dyn Keyring>,
    block: &EncryptionBlock,
) -> Result<EncryptionMetadata> {
    let key = if block.wrapped {
        let keyring = keyring.ok_or(LogError::KeyringUnavailable)?;
        keyring.unwrap(block.master_key_id, &block.key)?
    } else {
        block.key
    };
    Ok(EncryptionMetadata { key, iv: block.iv })
}

impl LogSys {
    /// Reads the encryption info of log file `file_id`. Returns `Ok(None)` when
    /// the file carries none.
    pub fn read_encryption(&self, file_id: u64) -> Result<Option<EncryptionMetadata>> {
        let io = {
            let files = self.files.lock();
            let file = files.get(file_id).ok_or(LogError::NotFound)?;
            std::sync::Arc::clone(file.io())
        };
        let mut raw = [0u8; LOG_BLOCK_SIZE as usize];
        io.read_at(ENCRYPTION_OFFSET, &mut raw)?;
        match EncryptionBlock::decode(&raw)? {
            Some(block) => Ok(Some(decode_metadata(self.keyring(), &block)?)),
            None => Ok(None),
        }
    }

    /// Persists `metadata` into the file holding the current checkpoint and
    /// makes it the metadata copied into new files.
    ///
    /// Takes the writer and file-set guards so the block can never be torn
    /// relative to a concurrent checkpoint header write.
    pub fn write_encryption(
        &self,
        writer: &mut MutexGuard<'_, WriterState>,
        files: &mut MutexGuard<'_, LogFileSet>,
        metadata: EncryptionMetadata,
        wrap_with_master_key: bool,
    ) -> Result<()> {
        let file_id = files
            .find(self.last_checkpoint_lsn())
            .map(|file| file.id)
            .ok_or(LogError::Corruption("checkpoint lsn outside the log files"))?;
        let state = self.persist_encryption(files, file_id, metadata, wrap_with_master_key)?;
        writer.set_encryption(state);
        Ok(())
    }

    /// Encodes `metadata` and writes it into file `file_id`. Callers hold the
    /// writer and file-set guards.
    pub(crate) fn persist_encryption(
        &self,
        files: &LogFileSet,
        file_id: u64,
        metadata: EncryptionMetadata,
        wrap_with_master_key: bool,
    ) -> Result<EncryptionState> {
        let block = encode_metadata(
            self.keyring(),
            files.log_uuid(),
            &metadata,
            wrap_with_master_key,
        )?;
        let file = files.get(file_id).ok_or(LogError::NotFound)?;
        file.io().write_at(ENCRYPTION_OFFSET, &block.encode())?;
        file.io().sync_all()?;
        info!(
            file = file_id,
            master_key_id = block.master_key_id,
            wrapped = block.wrapped,
            "log.encryption.write"
        );
        Ok(EncryptionState { metadata, block })
    }

    /// Generates new key material and persists it.
    pub fn generate_new_encryption(&self) -> Result<()> {
        if self.keyring().is_none() {
            return Err(LogError::KeyringUnavailable);
        }
        let (mut writer, mut files) = self.lock_for_header_write();
        self.write_encryption(&mut writer, &mut files, EncryptionMetadata::generate(), true)
    }

    /// Re-wraps the existing key with the new master key. A log without
    /// encryption info is left untouched.
    pub fn on_master_key_rotated(&self) -> Result<()> {
        let (mut writer, mut files) = self.lock_for_header_write();
        let Some(metadata) = writer.encryption_metadata() else {
            return Ok(());
        };
        self.write_encryption(&mut writer, &mut files, metadata, true)
    }

    /// Current in-memory metadata, if the log is encrypted.
    pub fn encryption_metadata(&self) -> Option<EncryptionMetadata> {
        self.writer.lock().encryption_metadata()
    }
}
