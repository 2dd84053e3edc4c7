// ABOUTME: Reporting commands: per-file replication status and drain
// ABOUTME: Drain blocks until a table's current files are fully replicated

use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;

use super::LedgerPaths;
use crate::report::{drain as drain_table, table_report, FileReport};
use crate::store::RecordStore;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only report this source table (default: every replicated table)
    #[arg(long)]
    pub table: Option<String>,
}

#[derive(Args, Debug)]
pub struct DrainArgs {
    /// Source table to wait for
    #[arg(long)]
    pub table: String,
    /// Give up after this many seconds
    #[arg(long = "timeout-secs", default_value_t = 300)]
    pub timeout_secs: u64,
    /// Interval between checks, in milliseconds
    #[arg(long = "poll-ms", default_value_t = 1000)]
    pub poll_ms: u64,
}

pub async fn status(paths: &LedgerPaths, args: StatusArgs) -> Result<()> {
    let store = paths.open_store()?;
    let tables = match args.table {
        Some(table) => vec![table],
        None => store.replicated_tables()?,
    };
    if tables.is_empty() {
        println!("No replicated tables configured.");
        return Ok(());
    }

    for table in tables {
        let reports = table_report(store.as_ref(), &table)
            .with_context(|| format!("Failed to read records of table {}", table))?;
        println!("Table {} ({} file(s))", table, reports.len());
        for report in &reports {
            print_file(report);
        }
    }
    Ok(())
}

fn print_file(report: &FileReport) {
    let status = match (&report.status, report.sequence) {
        (Some(progress), Some(sequence)) => format!("#{} {}", sequence, progress),
        _ => "status removed".to_string(),
    };
    let state = if report.removable {
        "removable".to_string()
    } else {
        format!("{} target(s) pending", report.pending_targets.len())
    };
    println!("  {}  {}  [{}]", report.file, status, state);
    for (target, progress) in &report.work {
        println!("    {}: {}", target, progress);
    }
}

pub async fn drain(paths: &LedgerPaths, args: DrainArgs) -> Result<()> {
    let store = paths.open_store()?;
    let drained = drain_table(
        store.as_ref(),
        &args.table,
        Duration::from_millis(args.poll_ms.max(1)),
        Duration::from_secs(args.timeout_secs),
    )
    .await
    .with_context(|| format!("Failed to drain table {}", args.table))?;
    println!("Table {} drained ({} file(s) waited on).", args.table, drained);
    Ok(())
}
