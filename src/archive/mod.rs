#![forbid(unsafe_code)]

//! Log archiving: streams committed log ranges into archive files for an
//! external consumer while the log keeps checkpointing.

mod client;
mod group;
mod state;
mod sys;

pub use client::ArchClient;
pub use group::{
    archive_file_path, group_dir, parse_archive_file_name, parse_group_dir_name, ArchFileInfo,
    ArchGroup,
};
pub use state::{transition, ArchEvent, ArchState};
pub use sys::{ArchCopyCtx, ArchLogSys, ArchStart, ArchStop};
