// ABOUTME: Commands that write progress: Status records from the source side
// ABOUTME: and Work record updates from shipping workers

use anyhow::{bail, Context, Result};
use clap::Args;

use super::LedgerPaths;
use crate::progress::ProgressRecord;
use crate::store::RecordStore;
use crate::target::ReplicationTarget;

/// Offsets shared by both record kinds. Leaving out `--end` means the file's
/// length is not known yet.
#[derive(Args, Debug, Clone)]
pub struct OffsetArgs {
    /// Offset up to which the file has been processed
    #[arg(long, default_value_t = 0)]
    pub begin: u64,
    /// Known end of the file
    #[arg(long)]
    pub end: Option<u64>,
    /// The file is sealed and will not grow
    #[arg(long)]
    pub closed: bool,
}

impl OffsetArgs {
    pub fn to_progress(&self) -> Result<ProgressRecord> {
        let progress = match self.end {
            Some(end) => ProgressRecord::new(self.begin, end, self.closed, false),
            None if self.closed => bail!("--closed requires --end"),
            None => ProgressRecord::new(self.begin, 0, false, true),
        };
        Ok(progress)
    }
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Path of the write-ahead log file
    pub file: String,
    /// Source table the file holds mutations for
    #[arg(long)]
    pub table: String,
    #[command(flatten)]
    pub offsets: OffsetArgs,
}

#[derive(Args, Debug)]
pub struct ProgressArgs {
    /// Path of the write-ahead log file
    pub file: String,
    /// Source table the file holds mutations for
    #[arg(long)]
    pub table: String,
    /// Peer cluster name
    #[arg(long)]
    pub peer: String,
    /// Table id on the peer
    #[arg(long = "remote-table")]
    pub remote_table: String,
    #[command(flatten)]
    pub offsets: OffsetArgs,
}

pub async fn register(paths: &LedgerPaths, args: RegisterArgs) -> Result<()> {
    let store = paths.open_store()?;
    let progress = args.offsets.to_progress()?;
    let entry = store
        .record_status(&args.file, &args.table, progress)
        .with_context(|| format!("Failed to record status of {}", args.file))?;
    println!(
        "{} (table {}, sequence {}): {}",
        args.file, entry.source_table_id, entry.sequence, entry.progress
    );
    Ok(())
}

pub async fn progress(paths: &LedgerPaths, args: ProgressArgs) -> Result<()> {
    let store = paths.open_store()?;
    let target = ReplicationTarget::new(&args.peer, &args.remote_table, &args.table);
    let progress = args.offsets.to_progress()?;
    let merged = store
        .update_work_record(&args.file, &target, progress)
        .with_context(|| format!("Failed to update work of {} toward {}", args.file, target))?;
    println!("{} -> {}: {}", args.file, target, merged);
    Ok(())
}
