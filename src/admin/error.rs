use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::LogError;

/// Why an inspection command could not produce its report.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The path given is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    /// The directory holds no `redo_NNNNNN.log` file.
    #[error("no redo log found in {0}")]
    MissingLog(PathBuf),
    /// Decoding or recovery failed inside the log layer.
    #[error(transparent)]
    Log(#[from] LogError),
    /// Listing or reading the directory failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of an inspection command.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_log(path: impl AsRef<Path>) -> Self {
        AdminError::MissingLog(path.as_ref().to_path_buf())
    }
}

/// Rejects anything but an existing directory before it is scanned.
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(AdminError::NotADirectory(dir.to_path_buf()))
    }
}
