//! Recovery picks up the last durable checkpoint and the log end after the
//! log stopped without a final checkpoint.

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use common::{corrupt_byte_at, open_small, read_payload, record, write_records};
use redolog::admin;
use redolog::log::format::HeaderSlot;
use redolog::log::files::log_file_path;
use tempfile::tempdir;

#[test]
fn reopen_recovers_checkpoint_and_log_end() {
    let dir = tempdir().unwrap();
    let (checkpoint, end, records) = {
        let (log, _pool) = open_small(dir.path());
        write_records(&log, 0, 30, 400);
        log.request_checkpoint(true).unwrap();
        let checkpoint = log.last_checkpoint_lsn();
        log.disable_checkpoints_for_test(true);
        let records = write_records(&log, 30, 30, 400);
        let end = log.current_lsn();
        log.shutdown().unwrap();
        (checkpoint, end, records)
    };

    let (log, _pool) = open_small(dir.path());
    assert_eq!(log.last_checkpoint_lsn(), checkpoint);
    assert_eq!(log.current_lsn(), end);
    for (n, (start, _)) in records.iter().enumerate() {
        assert_eq!(read_payload(&log, *start, 400), record(30 + n as u64, 400));
    }

    // Appending continues the recovered stream.
    let more = write_records(&log, 60, 3, 100);
    assert_eq!(more[0].0, end);
    log.request_checkpoint(true).unwrap();
    assert_eq!(log.last_checkpoint_lsn(), log.current_lsn());
    log.shutdown().unwrap();
}

#[test]
fn torn_newest_slot_falls_back_to_other_slot() {
    let dir = tempdir().unwrap();
    {
        let (log, _pool) = open_small(dir.path());
        write_records(&log, 0, 5, 200);
        log.request_checkpoint(true).unwrap();
        write_records(&log, 5, 5, 200);
        log.request_checkpoint(true).unwrap();
        log.disable_checkpoints_for_test(true);
        log.shutdown().unwrap();
    }
    let report = admin::inspect(dir.path()).unwrap();
    let file = &report.files[0];
    let lsns: Vec<u64> = file
        .slots
        .iter()
        .map(|slot| slot.checkpoint_lsn.expect("both slots written"))
        .collect();
    let (newest, older) = if lsns[0] > lsns[1] {
        (HeaderSlot::First, lsns[1])
    } else {
        (HeaderSlot::Second, lsns[0])
    };
    let newest_lsn = lsns[0].max(lsns[1]);
    assert_eq!(admin::recover(dir.path()).unwrap().checkpoint_lsn, newest_lsn);

    corrupt_byte_at(&log_file_path(dir.path(), 0), newest.offset() + 20).unwrap();
    let recovered = admin::recover(dir.path()).unwrap();
    assert_eq!(recovered.checkpoint_lsn, older);
    assert_eq!(recovered.slot, newest.other());

    let (log, _pool) = open_small(dir.path());
    assert_eq!(log.last_checkpoint_lsn().0, older);
    log.shutdown().unwrap();
}

#[test]
fn reclaimed_files_are_not_needed_for_recovery() {
    let dir = tempdir().unwrap();
    let checkpoint = {
        let (log, _pool) = open_small(dir.path());
        // Roughly three files worth of payload.
        write_records(&log, 0, 480, 400);
        log.request_checkpoint_in_next_file().unwrap();
        let checkpoint = log.last_checkpoint_lsn();
        let oldest = log.files_snapshot()[0].id;
        assert!(oldest > 0, "files before the checkpoint were reclaimed");
        assert!(!log_file_path(dir.path(), 0).exists());
        log.disable_checkpoints_for_test(true);
        log.shutdown().unwrap();
        checkpoint
    };
    let (log, _pool) = open_small(dir.path());
    assert_eq!(log.last_checkpoint_lsn(), checkpoint);
    log.shutdown().unwrap();
}
