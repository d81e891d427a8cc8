#![forbid(unsafe_code)]

//! Read-only inspection of log and archive directories.
//!
//! These functions never open a [`crate::LogSys`]; they decode headers
//! directly so they can run against a directory another process owns.

mod error;
mod inspect;

/// Error types for inspection commands.
pub use error::{AdminError, Result};

/// Header, checkpoint and archive reports.
pub use inspect::{
    archive_files, inspect, recover, ArchiveFileReport, ArchiveFilesReport, ArchiveGroupReport,
    EncryptionReport, FileReport, HeaderReport, InspectReport, RecoverReport, SlotReport,
};
