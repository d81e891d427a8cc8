#![forbid(unsafe_code)]

//! Shared value types and the crate-wide error.

use std::fmt;
use std::ops::{Add, Sub};

/// Block checksums.
pub mod checksum;

pub use checksum::block_crc32;

/// Log sequence number: byte offset into the conceptual infinite redo stream,
/// block headers and trailers included.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

/// Sequence number counting payload bytes only (no block framing).
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
#[serde(transparent)]
pub struct Sn(pub u64);

impl Lsn {
    /// Zero lsn, used as "unset".
    pub const ZERO: Lsn = Lsn(0);

    /// Rounds down to a multiple of `align` (a power of two).
    pub const fn align_down(self, align: u64) -> Lsn {
        Lsn(self.0 & !(align - 1))
    }

    /// Rounds up to a multiple of `align` (a power of two).
    pub const fn align_up(self, align: u64) -> Lsn {
        Lsn((self.0 + align - 1) & !(align - 1))
    }

    /// Distance from `earlier`, zero if `earlier` is ahead.
    pub const fn saturating_since(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Returns true when no lsn has been recorded.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl Sub<u64> for Lsn {
    type Output = Lsn;

    fn sub(self, rhs: u64) -> Lsn {
        Lsn(self.0 - rhs)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Sn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(value: Lsn) -> Self {
        value.0
    }
}

/// Errors surfaced by the checkpoint, free-check and archiver paths.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// Underlying file operation failed; callers retry on their next pass.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller passed something the log cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Owned variant of [`LogError::Invalid`] for formatted messages.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A blocking wait was interrupted because the log is shutting down.
    #[error("interrupted by shutdown")]
    Interrupted,
    /// A bounded wait ran out of time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The archiver stopped while a client still expected it to run.
    #[error("internal error: archiver failed")]
    ArchiverFailed,
    /// Encryption is configured but no key service is reachable.
    #[error("keyring unavailable")]
    KeyringUnavailable,
    /// The component was switched to read-only operation.
    #[error("read-only mode")]
    ReadOnly,
    /// Requested object does not exist.
    #[error("not found")]
    NotFound,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LogError>;
