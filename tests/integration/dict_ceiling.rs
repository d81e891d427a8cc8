//! The dictionary ceiling caps how far checkpoints may advance.

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, open_with, write_records};
use redolog::log::{DictPersistence, LogOptions};
use redolog::Lsn;
use tempfile::tempdir;

#[derive(Default)]
struct CountingDict {
    persisted: AtomicU64,
}

impl DictPersistence for CountingDict {
    fn persist_pending_metadata(&self) -> redolog::Result<()> {
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn checkpoint_stops_at_dictionary_ceiling() {
    let dir = tempdir().unwrap();
    let dict = Arc::new(CountingDict::default());
    let (log, _pool) = open_with(LogOptions::small(dir.path()), |collab| {
        collab.with_dict(dict.clone())
    });
    let records = write_records(&log, 0, 40, 300);
    let (ceiling, _) = records[20];
    log.set_dict_max_allowed_checkpoint_lsn(ceiling);

    log.request_checkpoint(false).unwrap();
    assert!(eventually(Duration::from_secs(5), || {
        log.last_checkpoint_lsn() == ceiling
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(log.last_checkpoint_lsn(), ceiling);
    assert_eq!(log.checkpoint_target(), ceiling);
    assert!(dict.persisted.load(Ordering::SeqCst) > 0);
    assert_eq!(
        log.limits_snapshot().dict_max_allowed_checkpoint_lsn,
        ceiling.0
    );

    log.set_dict_max_allowed_checkpoint_lsn(Lsn::ZERO);
    log.request_checkpoint(true).unwrap();
    assert_eq!(log.last_checkpoint_lsn(), log.current_lsn());
    log.shutdown().unwrap();
}
