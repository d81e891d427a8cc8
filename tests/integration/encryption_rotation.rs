//! Encryption metadata follows the checkpoint file and survives master key
//! rotation and restarts.

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{open_with, write_records, TestKeyring};
use redolog::admin;
use redolog::log::{DirtyPageTracker, LogCollaborators, LogOptions, LogSys};
use redolog::LogError;
use tempfile::tempdir;

fn encrypted(dir: &std::path::Path) -> LogOptions {
    LogOptions {
        encryption: true,
        ..LogOptions::small(dir)
    }
}

#[test]
fn encryption_requires_keyring() {
    let dir = tempdir().unwrap();
    let pool = Arc::new(DirtyPageTracker::new());
    let err = LogSys::open(encrypted(dir.path()), LogCollaborators::new(pool)).unwrap_err();
    assert!(matches!(err, LogError::KeyringUnavailable));
}

#[test]
fn rotation_rewraps_and_checkpoint_file_carries_block() {
    let dir = tempdir().unwrap();
    let keyring = Arc::new(TestKeyring::default());
    let (log, _pool) = open_with(encrypted(dir.path()), |collab| {
        collab.with_keyring(keyring.clone())
    });
    let metadata = log.encryption_metadata().expect("metadata");
    assert_eq!(log.read_encryption(0).unwrap(), Some(metadata.clone()));

    let report = admin::inspect(dir.path()).unwrap();
    let enc = report.files[0].encryption.as_ref().expect("encryption block");
    assert!(enc.wrapped);
    assert_eq!(enc.master_key_id, 1);

    keyring.rotations.fetch_add(1, Ordering::SeqCst);
    log.on_master_key_rotated().unwrap();
    let report = admin::inspect(dir.path()).unwrap();
    assert_eq!(report.files[0].encryption.as_ref().unwrap().master_key_id, 2);
    // Same key, wrapped differently.
    assert_eq!(log.read_encryption(0).unwrap(), Some(metadata.clone()));
    assert_eq!(log.encryption_metadata(), Some(metadata.clone()));

    write_records(&log, 0, 60, 300);
    log.request_checkpoint_in_next_file().unwrap();
    let newest = log.files_snapshot().last().map(|f| f.id).unwrap();
    assert!(newest > 0);
    assert_eq!(log.read_encryption(newest).unwrap(), Some(metadata.clone()));
    let report = admin::inspect(dir.path()).unwrap();
    let last = report.files.last().unwrap();
    assert_eq!(last.encryption.as_ref().unwrap().master_key_id, 2);
    log.shutdown().unwrap();
    drop(log);

    let (reopened, _pool) = open_with(encrypted(dir.path()), |collab| {
        collab.with_keyring(keyring.clone())
    });
    assert_eq!(reopened.encryption_metadata(), Some(metadata));
    reopened.shutdown().unwrap();
    drop(reopened);

    let pool = Arc::new(DirtyPageTracker::new());
    let err = LogSys::open(LogOptions::small(dir.path()), LogCollaborators::new(pool)).unwrap_err();
    assert!(matches!(err, LogError::KeyringUnavailable));
}

#[test]
fn unencrypted_log_ignores_rotation() {
    let dir = tempdir().unwrap();
    let (log, _pool) = open_with(LogOptions::small(dir.path()), |collab| {
        collab.with_keyring(Arc::new(TestKeyring::default()))
    });
    assert!(log.encryption_metadata().is_none());
    log.on_master_key_rotated().unwrap();
    assert_eq!(log.read_encryption(0).unwrap(), None);
    log.shutdown().unwrap();
}
