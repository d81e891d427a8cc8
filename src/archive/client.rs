#![forbid(unsafe_code)]

//! Per-client view of the archiver: start, stop and the archived file ranges.

use std::path::Path;
use std::sync::Arc;

use crate::archive::group::ArchGroup;
use crate::archive::sys::{ArchLogSys, ArchStop};
use crate::log::format::LOG_FILE_HDR_SIZE;
use crate::types::{LogError, Lsn, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ClientState {
    Init,
    Started,
    Stopped,
}

/// One archiving client: start, stop, then enumerate the archived bytes.
///
/// Dropping the client releases its group reference.
pub struct ArchClient {
    sys: Arc<ArchLogSys>,
    durable: bool,
    state: ClientState,
    group: Option<Arc<ArchGroup>>,
    begin_lsn: Lsn,
    header: Vec<u8>,
    stop: Option<ArchStop>,
}

impl ArchClient {
    /// New client; `durable` keeps the archive files after release.
    pub fn new(sys: Arc<ArchLogSys>, durable: bool) -> Self {
        Self {
            sys,
            durable,
            state: ClientState::Init,
            group: None,
            begin_lsn: Lsn::ZERO,
            header: Vec::new(),
            stop: None,
        }
    }

    /// Begins archiving. Returns the header region to write in front of the
    /// copied data.
    pub fn start(&mut self) -> Result<&[u8]> {
        if self.state != ClientState::Init {
            return Err(LogError::Invalid("archive client already started"));
        }
        let started = self.sys.start(self.durable)?;
        self.group = Some(started.group);
        self.begin_lsn = started.begin_lsn;
        self.header = started.header;
        self.state = ClientState::Started;
        Ok(&self.header)
    }

    /// Stops archiving and waits until the archiver caught up.
    pub fn stop(&mut self) -> Result<&ArchStop> {
        if self.state != ClientState::Started {
            return Err(LogError::Invalid("archive client not started"));
        }
        let group = self
            .group
            .as_ref()
            .ok_or(LogError::Invalid("archive client without a group"))?;
        let stop = self.sys.stop(group)?;
        self.state = ClientState::Stopped;
        Ok(self.stop.insert(stop))
    }

    /// First lsn covered by this client.
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// Lsn where the client stopped.
    pub fn end_lsn(&self) -> Option<Lsn> {
        self.stop.as_ref().map(|stop| stop.end_lsn)
    }

    /// Calls `callback(path, start_offset, end_offset)` for every archive
    /// file holding bytes of `[begin_lsn, end_lsn)`, in lsn order. Offsets are
    /// byte positions inside the file.
    ///
    /// An empty range still reports the file `begin_lsn` falls into, with
    /// equal offsets.
    pub fn get_files<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Path, u64, u64) -> Result<()>,
    {
        if self.state != ClientState::Stopped {
            return Err(LogError::Invalid("archive client not stopped"));
        }
        let (Some(group), Some(stop)) = (&self.group, &self.stop) else {
            return Err(LogError::Invalid("archive client without a group"));
        };
        let begin = self.begin_lsn;
        let end = stop.end_lsn;
        let files = group.files();
        if begin >= end {
            let file = files
                .iter()
                .rev()
                .find(|file| file.start_lsn <= begin)
                .ok_or(LogError::Invalid("archive group without a file"))?;
            let offset =
                LOG_FILE_HDR_SIZE + begin.min(file.end_lsn).saturating_since(file.start_lsn);
            return callback(&file.path, offset, offset);
        }
        for file in files {
            if file.end_lsn <= begin || file.start_lsn >= end {
                continue;
            }
            let from = begin.max(file.start_lsn);
            let to = end.min(file.end_lsn);
            callback(
                &file.path,
                LOG_FILE_HDR_SIZE + from.saturating_since(file.start_lsn),
                LOG_FILE_HDR_SIZE + to.saturating_since(file.start_lsn),
            )?;
        }
        Ok(())
    }

    /// Copies the archived range into one byte vector: header region, data,
    /// then the trailer block.
    pub fn collect(&self) -> Result<Vec<u8>> {
        let mut out = self.header.clone();
        self.get_files(|path, from, to| {
            let raw = std::fs::read(path)?;
            let slice = raw
                .get(from as usize..to as usize)
                .ok_or(LogError::Corruption("archive file shorter than expected"))?;
            out.extend_from_slice(slice);
            Ok(())
        })?;
        if let Some(stop) = &self.stop {
            out.extend_from_slice(&stop.trailer[..stop.trailer_len]);
        }
        Ok(out)
    }
}

impl Drop for ArchClient {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            if self.state == ClientState::Started {
                if let Err(err) = self.sys.stop(&group) {
                    tracing::warn!(error = %err, "arch.client.stop_on_drop_failed");
                }
            }
            self.sys.release(&group, self.durable);
        }
    }
}
