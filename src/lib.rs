//! Redo log checkpointing, free-space reclamation and archiving.
//!
//! [`log::LogSys`] owns a fixed set of log files, a write path and a
//! background checkpointer. [`archive::ArchLogSys`] copies log ranges into
//! archive groups for external consumers. [`admin`] decodes on-disk state
//! without opening the log.

#![warn(missing_docs)]

pub mod admin;
pub mod archive;
pub mod log;
pub mod primitives;
pub mod types;

pub use types::{LogError, Lsn, Result, Sn};
