#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, open_small, open_with, write_records, FaultyIoProvider};
use redolog::log::lsn::{first_data_lsn, is_data_lsn};
use redolog::log::{CounterMetrics, LogOptions};
use redolog::LogError;
use tempfile::tempdir;

#[test]
fn fresh_log_starts_with_checkpoint_at_first_data_lsn() {
    let dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    assert_eq!(log.last_checkpoint_lsn(), first_data_lsn());
    assert_eq!(log.current_lsn(), first_data_lsn());
    assert_eq!(log.files_snapshot().len(), 1);
    log.shutdown().unwrap();
}

#[test]
fn sync_request_checkpoints_at_current_lsn() {
    let dir = tempdir().unwrap();
    let (log, pool) = open_small(dir.path());
    let records = write_records(&log, 0, 40, 300);
    assert!(pool.dirty_count() > 0);

    log.request_checkpoint(true).unwrap();
    let (_, end) = *records.last().unwrap();
    assert_eq!(log.last_checkpoint_lsn(), end);
    assert!(is_data_lsn(log.last_checkpoint_lsn()));
    assert!(log.last_checkpoint_lsn() <= log.flushed_to_disk_lsn());
    assert_eq!(pool.dirty_count(), 0);

    assert!(
        !log.make_latest_checkpoint().unwrap(),
        "nothing new to checkpoint"
    );
    write_records(&log, 40, 5, 100);
    assert!(log.make_latest_checkpoint().unwrap());
    log.shutdown().unwrap();
}

#[test]
fn checkpoint_never_passes_oldest_dirty_page() {
    let dir = tempdir().unwrap();
    let (log, pool) = open_small(dir.path());
    pool.set_paused(true);
    let records = write_records(&log, 0, 20, 200);
    let (pinned, _) = records[3];
    // Pages of records 0..3 are clean; record 3's page stays dirty.
    pool.clean_up_to(pinned);

    // The request lies past the dirty page, so it stays pending.
    log.request_checkpoint(false).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(log.last_checkpoint_lsn() <= pinned);

    // Periodic checkpoints advance only up to the dirty page.
    log.set_periodic_checkpoints(true);
    assert!(eventually(Duration::from_secs(5), || {
        log.last_checkpoint_lsn() == pinned
    }));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(log.last_checkpoint_lsn(), pinned);
    assert!(log.last_checkpoint_lsn() <= log.flushed_to_disk_lsn());

    pool.set_paused(false);
    log.request_checkpoint(true).unwrap();
    assert_eq!(log.last_checkpoint_lsn(), log.current_lsn());
    log.shutdown().unwrap();
}

#[test]
fn checkpoint_is_monotonic_under_concurrent_writers() {
    let dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let writers: Vec<_> = (0..2u64)
        .map(|w| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || write_records(&log, w * 1000, 400, 250))
        })
        .collect();
    let mut seen = log.last_checkpoint_lsn();
    while writers.iter().any(|w| !w.is_finished()) {
        let now = log.last_checkpoint_lsn();
        assert!(now >= seen, "checkpoint moved backwards");
        assert!(now <= log.current_lsn());
        seen = now;
        std::thread::sleep(Duration::from_millis(1));
    }
    for writer in writers {
        writer.join().unwrap();
    }
    assert!(log.last_checkpoint_lsn() > first_data_lsn());
    assert!(
        log.files_snapshot().len() <= log.options().n_files as usize,
        "consumed files are reclaimed"
    );
    log.shutdown().unwrap();
}

#[test]
fn failed_header_write_changes_nothing() {
    let dir = tempdir().unwrap();
    let io = FaultyIoProvider::default();
    let faults = Arc::clone(&io.faults);
    let metrics = Arc::new(CounterMetrics::default());
    let (log, _pool) = open_with(LogOptions::small(dir.path()), |collab| {
        collab
            .with_io(Arc::new(io.clone()))
            .with_metrics(metrics.clone())
    });
    log.disable_checkpoints_for_test(true);
    let records = write_records(&log, 0, 10, 200);
    log.write_up_to(log.current_lsn(), true).unwrap();
    let before = log.last_checkpoint_lsn();
    let (target, _) = records[5];

    faults.fail_writes.store(true, Ordering::SeqCst);
    let err = log.write_checkpoint(target).unwrap_err();
    assert!(matches!(err, LogError::Io(_)));
    assert_eq!(log.last_checkpoint_lsn(), before);
    assert_eq!(metrics.checkpoint_failures.load(Ordering::Relaxed), 1);

    faults.fail_writes.store(false, Ordering::SeqCst);
    log.write_checkpoint(target).unwrap();
    assert_eq!(log.last_checkpoint_lsn(), target);
    assert_eq!(metrics.last_checkpoint_lsn.load(Ordering::Relaxed), target.0);
    log.shutdown().unwrap();
}

#[test]
fn checkpoints_wait_for_enable() {
    let dir = tempdir().unwrap();
    common::init_tracing();
    let pool = Arc::new(redolog::log::DirtyPageTracker::new());
    let log = redolog::log::LogSys::open(
        LogOptions::small(dir.path()),
        redolog::log::LogCollaborators::new(pool),
    )
    .unwrap();
    write_records(&log, 0, 10, 200);
    log.request_checkpoint(false).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(log.last_checkpoint_lsn(), first_data_lsn());

    log.enable_checkpoints();
    assert!(eventually(Duration::from_secs(5), || {
        log.last_checkpoint_lsn() == log.current_lsn()
    }));
    log.shutdown().unwrap();
}

#[test]
fn periodic_checkpoints_follow_the_toggle() {
    let dir = tempdir().unwrap();
    let opts = LogOptions {
        checkpoint_every: Duration::from_millis(20),
        ..LogOptions::small(dir.path())
    };
    let (log, pool) = open_with(opts, |collab| collab);
    write_records(&log, 0, 30, 300);
    pool.clean_up_to(log.current_lsn());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(log.last_checkpoint_lsn(), first_data_lsn());

    log.set_periodic_checkpoints(true);
    let end = log.current_lsn();
    assert!(eventually(Duration::from_secs(5), || {
        log.last_checkpoint_lsn() == end
    }));
    log.shutdown().unwrap();
}

#[test]
fn thread_concurrency_resizes_the_margin() {
    let dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let before = log.limits_snapshot();
    let fcc_before = log.free_check_capacity();
    assert!(before.concurrency_margin_is_safe);

    log.set_thread_concurrency(8);
    let wider = log.limits_snapshot();
    assert!(wider.concurrency_margin > before.concurrency_margin);
    assert!(log.free_check_capacity() < fcc_before);

    // Zero means unlimited; the margin is clamped and flagged.
    log.set_thread_concurrency(0);
    let clamped = log.limits_snapshot();
    assert!(!clamped.concurrency_margin_is_safe);
    assert_eq!(
        clamped.concurrency_margin,
        log.capacity().soft_logical / 100 * 50
    );
    assert!(log.free_check_capacity() + clamped.concurrency_margin <= log.capacity().soft_logical);
    log.shutdown().unwrap();
}
