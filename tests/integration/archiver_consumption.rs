//! Log files are not reclaimed while the archiver still needs them.

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{open_small, open_with, write_records, FaultyIoProvider};
use redolog::archive::{ArchClient, ArchCopyCtx, ArchLogSys, ArchState};
use redolog::log::{ArchiveOptions, LogOptions};
use redolog::LogError;
use tempfile::tempdir;

fn drive(arch: &ArchLogSys, ctx: &mut ArchCopyCtx) {
    let mut init = true;
    loop {
        assert!(!arch.archive(init, ctx), "archiver aborted");
        init = false;
        if ctx.need_wait {
            break;
        }
    }
}

#[test]
fn files_wait_for_the_archiver() {
    let dir = tempdir().unwrap();
    let arch_dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let arch =
        ArchLogSys::open_without_worker(log.clone(), ArchiveOptions::small(arch_dir.path()))
            .unwrap();

    let mut client = ArchClient::new(arch.clone(), false);
    client.start().unwrap();
    let begin = client.begin_lsn();
    assert_eq!(arch.archived_lsn(), begin);

    write_records(&log, 0, 150, 600);
    log.request_checkpoint_in_next_file().unwrap();
    assert!(log.last_checkpoint_lsn() > begin);
    let files = log.files_snapshot();
    assert_eq!(files[0].id, 0, "file 0 still holds unarchived data");
    assert!(files.len() >= 3);
    assert_eq!(arch.archived_lsn(), begin);

    let mut ctx = ArchCopyCtx::default();
    drive(&arch, &mut ctx);
    assert!(arch.archived_lsn().0 > log.files_snapshot()[1].end_lsn);

    write_records(&log, 150, 5, 100);
    log.request_checkpoint(true).unwrap();
    let files = log.files_snapshot();
    assert!(files[0].id >= 2, "archived files were reclaimed: {files:?}");

    arch.force_read_only();
    assert!(client.stop().is_err());
    drop(client);
    arch.shutdown().unwrap();
    log.shutdown().unwrap();
}

#[test]
fn stop_fails_once_a_copy_error_ended_the_group() {
    let dir = tempdir().unwrap();
    let arch_dir = tempdir().unwrap();
    let io = FaultyIoProvider {
        only_paths_containing: Some("ib_log_"),
        ..FaultyIoProvider::default()
    };
    let faults = io.faults.clone();
    let (log, _pool) = open_with(LogOptions::small(dir.path()), |collab| {
        collab.with_io(Arc::new(io))
    });
    let arch =
        ArchLogSys::open_without_worker(log.clone(), ArchiveOptions::small(arch_dir.path()))
            .unwrap();

    let mut first = ArchClient::new(arch.clone(), false);
    first.start().unwrap();
    write_records(&log, 0, 20, 300);
    log.write_up_to(log.current_lsn(), true).unwrap();

    faults.fail_writes.store(true, Ordering::SeqCst);
    let mut ctx = ArchCopyCtx::default();
    drive(&arch, &mut ctx);
    assert_eq!(arch.state(), ArchState::Idle);
    faults.fail_writes.store(false, Ordering::SeqCst);

    // A new group starts while the first client still holds the failed one.
    let mut second = ArchClient::new(arch.clone(), false);
    second.start().unwrap();
    assert_eq!(arch.state(), ArchState::Active);
    assert!(arch.archived_lsn() >= second.begin_lsn());

    let err = first.stop().unwrap_err();
    assert!(matches!(err, LogError::ArchiverFailed), "got {err:?}");
    second.stop().unwrap();

    drop(first);
    drop(second);
    arch.shutdown().unwrap();
    log.shutdown().unwrap();
}
