//! Writers block in the free check while the checkpoint cannot advance and
//! resume once page flushing catches up.

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{eventually, open_small, open_with, record};
use redolog::log::{CounterMetrics, LogOptions};
use redolog::LogError;
use tempfile::tempdir;

const RECORD: usize = 1000;

#[test]
fn fast_path_does_not_wait() {
    let dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let stats = log.free_check().unwrap();
    assert!(stats.is_immediate());
    assert!(log.limits_snapshot().free_check_limit_sn > log.current_sn().0);
    log.shutdown().unwrap();
}

#[test]
fn writer_blocks_until_flushing_resumes() {
    let dir = tempdir().unwrap();
    let metrics = Arc::new(CounterMetrics::default());
    let (log, pool) = open_with(LogOptions::small(dir.path()), |collab| {
        collab.with_metrics(metrics.clone())
    });
    pool.set_paused(true);
    let fcc = log.free_check_capacity();
    let total = 2 * fcc / RECORD as u64;

    let writer = {
        let log = Arc::clone(&log);
        thread::spawn(move || -> redolog::Result<u64> {
            for n in 0..total {
                log.free_check()?;
                log.append(&record(n, RECORD), &[n % 8])?;
            }
            Ok(total)
        })
    };

    // The writer stalls once it used up the free-check capacity.
    assert!(eventually(Duration::from_secs(5), || {
        log.current_lsn().saturating_since(log.last_checkpoint_lsn()) >= fcc
    }));
    thread::sleep(Duration::from_millis(100));
    assert!(!writer.is_finished());
    assert!(pool.flush_requests() > 0, "checkpointer asked for flushes");
    assert!(log.limits_snapshot().requested_checkpoint_lsn > log.last_checkpoint_lsn().0);

    pool.set_paused(false);
    assert_eq!(writer.join().unwrap().unwrap(), total);
    assert!(metrics.free_check_waits.load(Ordering::Relaxed) > 0);
    assert!(
        log.current_lsn().saturating_since(log.last_checkpoint_lsn()) <= log.capacity().hard_logical
    );
    log.shutdown().unwrap();
}

#[test]
fn shutdown_interrupts_blocked_writer() {
    let dir = tempdir().unwrap();
    let (log, pool) = open_small(dir.path());
    pool.set_paused(true);
    let fcc = log.free_check_capacity();

    let writer = {
        let log = Arc::clone(&log);
        thread::spawn(move || -> redolog::Result<()> {
            let mut n = 0;
            loop {
                log.free_check()?;
                log.append(&record(n, RECORD), &[n % 8])?;
                n += 1;
            }
        })
    };
    assert!(eventually(Duration::from_secs(5), || {
        log.current_lsn().saturating_since(log.last_checkpoint_lsn()) >= fcc
    }));
    log.shutdown().unwrap();
    let err = writer.join().unwrap().unwrap_err();
    assert!(matches!(err, LogError::Interrupted));
}
