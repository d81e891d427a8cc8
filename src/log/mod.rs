#![forbid(unsafe_code)]

//! Redo log: file set, write path, checkpointing and free-space reclamation.
//!
//! A [`LogSys`] owns the log files in one directory and a background
//! checkpointer thread. Writers pass [`LogSys::free_check`] before appending;
//! the checkpointer advances the checkpoint as far as the buffer pool allows
//! and reclaims files nobody needs any more.

/// Capacity model and checkpoint-age thresholds.
pub mod capacity;
mod checkpoint;
mod checkpointer;
/// Collaborator traits and reference implementations.
pub mod collab;
mod encryption;
/// Log files on disk and their consumers.
pub mod files;
/// On-disk layout of headers and blocks.
pub mod format;
mod free_check;
mod limits;
/// Lsn geometry.
pub mod lsn;
/// Metrics hooks.
pub mod metrics;
mod options;
mod sys;

pub use capacity::{CheckpointAges, LogCapacity};
pub use checkpoint::{
    available_for_checkpoint, checkpoint_target, recover_checkpoint, AvailableInputs,
    CheckpointDecision, CheckpointReason, RecoveredCheckpoint,
};
pub use collab::{ActivityCounter, BufferPool, DictPersistence, DirtyPageTracker, NoopDictPersistence};
pub use encryption::{EncryptionMetadata, Keyring};
pub use files::{ConsumerId, LogConsumer, LogFileInfo, LogFileSet};
pub use limits::LimitsSnapshot;
pub use metrics::{CounterMetrics, LogMetrics, NoopMetrics};
pub use options::{ArchiveOptions, LogOptions};
pub use sys::{LogCollaborators, LogStatus, LogSys, WriterState};

#[cfg(test)]
pub(crate) use encryption::tests::XorKeyring;
