//! A client archives a log range while writers keep appending, then reads
//! the archived bytes back.

#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use common::{eventually, open_small, write_records};
use redolog::admin;
use redolog::archive::{group_dir, ArchClient, ArchLogSys, ArchState};
use redolog::log::format::LOG_FILE_HDR_SIZE;
use redolog::log::lsn::LOG_BLOCK_SIZE;
use redolog::log::ArchiveOptions;
use tempfile::tempdir;

const HDR: usize = LOG_FILE_HDR_SIZE as usize;

#[test]
fn archived_bytes_match_the_log() {
    let dir = tempdir().unwrap();
    let arch_dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    write_records(&log, 0, 10, 200);

    let arch = ArchLogSys::open(log.clone(), ArchiveOptions::small(arch_dir.path())).unwrap();
    let mut client = ArchClient::new(arch.clone(), false);
    let header = client.start().unwrap().to_vec();
    assert_eq!(header.len(), HDR);
    assert_eq!(arch.state(), ArchState::Active);
    let begin = client.begin_lsn();
    assert_eq!(begin.0 % LOG_BLOCK_SIZE, 0);

    // Enough to span several 32K archive files.
    write_records(&log, 10, 300, 400);
    let stop = client.stop().unwrap();
    let end = stop.end_lsn;
    let trailer_len = stop.trailer_len;
    assert!(end > begin);
    assert_eq!(end.0 % LOG_BLOCK_SIZE, 0);

    let mut expected = vec![0u8; (end.0 - begin.0) as usize];
    log.read_log(begin, &mut expected).unwrap();
    let collected = client.collect().unwrap();
    assert_eq!(&collected[..HDR], &header[..]);
    assert_eq!(&collected[HDR..HDR + expected.len()], &expected[..]);
    assert_eq!(collected.len(), HDR + expected.len() + trailer_len);
    if trailer_len > 0 {
        let mut last = vec![0u8; LOG_BLOCK_SIZE as usize];
        log.read_log(end, &mut last).unwrap();
        assert_eq!(&collected[HDR + expected.len()..], &last[..]);
    }

    let mut ranges = Vec::new();
    client
        .get_files(|path, from, to| {
            ranges.push((path.to_path_buf(), from, to));
            Ok(())
        })
        .unwrap();
    assert!(ranges.len() > 1, "range spans several archive files");
    assert!(ranges.iter().all(|(_, from, to)| *from >= LOG_FILE_HDR_SIZE && from < to));
    let copied: u64 = ranges.iter().map(|(_, from, to)| to - from).sum();
    assert_eq!(copied, end.0 - begin.0);

    let report = admin::archive_files(arch_dir.path()).unwrap();
    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(group.files[0].start_lsn, Some(begin.0));
    assert!(group.files[0].anchor_lsn.unwrap() >= begin.0);

    let group_path = group_dir(arch_dir.path(), group.uuid.parse().unwrap());
    drop(client);
    assert!(eventually(Duration::from_secs(5), || !group_path.exists()));
    assert!(eventually(Duration::from_secs(5), || arch.state() == ArchState::Idle));

    arch.shutdown().unwrap();
    log.shutdown().unwrap();
}

#[test]
fn durable_group_outlives_its_client() {
    let dir = tempdir().unwrap();
    let arch_dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let arch = ArchLogSys::open(log.clone(), ArchiveOptions::small(arch_dir.path())).unwrap();

    let mut client = ArchClient::new(arch.clone(), true);
    client.start().unwrap();
    write_records(&log, 0, 100, 300);
    client.stop().unwrap();
    let uuid = arch.current_group().map(|g| g.uuid());
    drop(client);
    assert!(eventually(Duration::from_secs(5), || arch.state() == ArchState::Idle));

    let report = admin::archive_files(arch_dir.path()).unwrap();
    assert_eq!(report.groups.len(), 1);
    if let Some(uuid) = uuid {
        assert_eq!(report.groups[0].uuid, uuid.to_string());
    }
    assert!(!report.groups[0].files.is_empty());

    arch.shutdown().unwrap();
    log.shutdown().unwrap();
}

#[test]
fn second_client_joins_active_group() {
    let dir = tempdir().unwrap();
    let arch_dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let arch = ArchLogSys::open(log.clone(), ArchiveOptions::small(arch_dir.path())).unwrap();

    let mut first = ArchClient::new(arch.clone(), false);
    first.start().unwrap();
    write_records(&log, 0, 20, 300);
    let mut second = ArchClient::new(arch.clone(), false);
    second.start().unwrap();
    assert!(second.begin_lsn() >= first.begin_lsn());
    write_records(&log, 20, 20, 300);

    first.stop().unwrap();
    assert_eq!(arch.state(), ArchState::Active);
    second.stop().unwrap();
    assert!(second.collect().unwrap().len() > HDR);
    assert!(first.start().is_err());

    drop(first);
    drop(second);
    assert!(eventually(Duration::from_secs(5), || {
        admin::archive_files(arch_dir.path()).unwrap().groups.is_empty()
    }));
    arch.shutdown().unwrap();
    log.shutdown().unwrap();
}

#[test]
fn empty_range_reports_one_file() {
    let dir = tempdir().unwrap();
    let arch_dir = tempdir().unwrap();
    let (log, _pool) = open_small(dir.path());
    let arch = ArchLogSys::open(log.clone(), ArchiveOptions::small(arch_dir.path())).unwrap();

    let mut client = ArchClient::new(arch.clone(), false);
    client.start().unwrap();
    let begin = client.begin_lsn();
    let stop = client.stop().unwrap();
    assert_eq!(stop.end_lsn, begin);
    assert_eq!(stop.trailer_len, 0);

    let mut ranges = Vec::new();
    client
        .get_files(|path, from, to| {
            ranges.push((path.to_path_buf(), from, to));
            Ok(())
        })
        .unwrap();
    assert_eq!(ranges.len(), 1, "{ranges:?}");
    let (path, from, to) = &ranges[0];
    assert_eq!(from, to);
    assert_eq!(*from, LOG_FILE_HDR_SIZE);
    assert!(path.ends_with("ib_log_0"));
    assert_eq!(client.collect().unwrap().len(), HDR);

    drop(client);
    arch.shutdown().unwrap();
    log.shutdown().unwrap();
}
