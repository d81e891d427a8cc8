//! Binary entry point for the redolog inspection CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand, ValueEnum};
use redolog::{
    admin::{self, ArchiveFilesReport, InspectReport, RecoverReport},
    log::{DirtyPageTracker, LogCollaborators, LogOptions, LogStatus, LogSys},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "redolog",
    version,
    about = "Inspect and exercise a redo log directory",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Decode file headers, checkpoint slots and encryption blocks")]
    Inspect {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    #[command(about = "Show the checkpoint recovery would start from")]
    Recover {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    #[command(about = "List archive groups and their files")]
    ArchiveFiles {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    #[command(about = "Append records from several threads and report log progress")]
    Workload {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, default_value_t = 4, help = "Writer threads")]
        threads: u32,
        #[arg(long, default_value_t = 1000, help = "Records per thread")]
        records: u32,
        #[arg(long, default_value_t = 200, help = "Payload bytes per record")]
        record_size: usize,
        #[arg(
            long,
            default_value_t = 256 * 1024,
            value_name = "BYTES",
            help = "Size of each log file"
        )]
        file_size: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { dir } => {
            let report = admin::inspect(&dir)?;
            emit(&cli.format, &report, |_| print_inspect_text(&report))?;
        }
        Command::Recover { dir } => {
            let report = admin::recover(&dir)?;
            emit(&cli.format, &report, |_| print_recover_text(&report))?;
        }
        Command::ArchiveFiles { dir } => {
            let report = admin::archive_files(&dir)?;
            emit(&cli.format, &report, |_| print_archive_text(&report))?;
        }
        Command::Workload {
            dir,
            threads,
            records,
            record_size,
            file_size,
        } => {
            let status = run_workload(dir, threads, records, record_size, file_size)?;
            emit(&cli.format, &status, |_| print_status_text(&status))?;
        }
    }
    Ok(())
}

fn run_workload(
    dir: PathBuf,
    threads: u32,
    records: u32,
    record_size: usize,
    file_size: u64,
) -> Result<LogStatus, Box<dyn Error>> {
    let opts = LogOptions {
        file_size,
        thread_concurrency: threads,
        ..LogOptions::small(&dir)
    };
    let pool = Arc::new(DirtyPageTracker::new());
    let log = LogSys::open(opts, LogCollaborators::new(pool))?;
    log.enable_checkpoints();

    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let log = Arc::clone(&log);
            thread::spawn(move || -> redolog::Result<()> {
                let payload = vec![worker as u8; record_size];
                for n in 0..records {
                    log.free_check()?;
                    let page = u64::from(worker) * 64 + u64::from(n % 64);
                    log.append(&payload, &[page])?;
                }
                Ok(())
            })
        })
        .collect();

    let mut failure = None;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failure = Some(err.to_string()),
            Err(_) => failure = Some("writer thread panicked".to_owned()),
        }
    }
    let end = log.current_lsn();
    let flushed = log.write_up_to(end, true);
    let status = log.status();
    log.shutdown()?;
    flushed?;
    if let Some(message) = failure {
        return Err(message.into());
    }
    Ok(status)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn opt_lsn(lsn: Option<u64>) -> String {
    lsn.map_or_else(|| "-".to_owned(), |lsn| lsn.to_string())
}

fn print_inspect_text(report: &InspectReport) {
    println!("Log directory: {}", report.dir.display());
    for file in &report.files {
        println!("File {} ({} bytes)", file.id, file.size);
        match (&file.header, &file.header_error) {
            (Some(header), _) => println!(
                "  format={} start_lsn={} uuid={} creator={:?}",
                header.format, header.start_lsn, header.log_uuid, header.creator
            ),
            (None, Some(err)) => println!("  header: {err}"),
            (None, None) => println!("  header: missing"),
        }
        for slot in &file.slots {
            match &slot.error {
                Some(err) => println!("  {:?}: {err}", slot.slot),
                None => println!(
                    "  {:?}: checkpoint_lsn={}",
                    slot.slot,
                    opt_lsn(slot.checkpoint_lsn)
                ),
            }
        }
        if let Some(enc) = &file.encryption {
            println!(
                "  encryption: master_key_id={} server_uuid={} wrapped={}",
                enc.master_key_id, enc.server_uuid, enc.wrapped
            );
        }
        if let Some(err) = &file.encryption_error {
            println!("  encryption: {err}");
        }
    }
}

fn print_recover_text(report: &RecoverReport) {
    println!("Log directory: {}", report.dir.display());
    println!(
        "  checkpoint_lsn={} file={} slot={:?} files={}",
        report.checkpoint_lsn, report.file_id, report.slot, report.files
    );
}

fn print_archive_text(report: &ArchiveFilesReport) {
    println!("Archive directory: {}", report.dir.display());
    if report.groups.is_empty() {
        println!("  no archive groups");
    }
    for group in &report.groups {
        println!("Group {}", group.uuid);
        for file in &group.files {
            println!(
                "  #{} start_lsn={} anchor_lsn={} {}",
                file.index,
                opt_lsn(file.start_lsn),
                opt_lsn(file.anchor_lsn),
                file.path.display()
            );
        }
    }
}

fn print_status_text(status: &LogStatus) {
    println!("Log:");
    println!(
        "  current_lsn={} flushed_to_disk_lsn={} last_checkpoint_lsn={}",
        status.current_lsn, status.flushed_to_disk_lsn, status.last_checkpoint_lsn
    );
    println!(
        "  capacity: soft_logical={} hard_logical={} concurrency_margin={}",
        status.capacity.soft_logical,
        status.capacity.hard_logical,
        status.limits.concurrency_margin
    );
    println!("Files:");
    for file in &status.files {
        println!(
            "  {} [{}, {}){}",
            file.id,
            file.start_lsn,
            file.end_lsn,
            if file.consumed { " consumed" } else { "" }
        );
    }
}
