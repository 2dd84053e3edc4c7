// ABOUTME: Per-file replication reports and drain (wait until a table is replicated)
// ABOUTME: Uses the same removal decision as the garbage collector

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::error::{LedgerError, Result};
use crate::gc::{group_table, removal_decision};
use crate::progress::{is_fully_replicated, ProgressRecord};
use crate::store::RecordStore;
use crate::target::ReplicationTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub file: String,
    pub sequence: Option<u64>,
    pub status: Option<ProgressRecord>,
    pub work: BTreeMap<ReplicationTarget, ProgressRecord>,
    /// Configured targets this file has not been fully replicated to.
    pub pending_targets: Vec<ReplicationTarget>,
    /// Whether the next garbage collection pass would delete this file's records.
    pub removable: bool,
}

/// Report every file recorded for `table`, in scan order.
pub fn table_report<S: RecordStore + ?Sized>(store: &S, table: &str) -> Result<Vec<FileReport>> {
    let configured = store.list_configured_targets(table)?;
    let mut reports = Vec::new();
    for item in store.scan_grouped_by_file()? {
        let group = match item {
            Ok(group) => group,
            Err(LedgerError::MalformedProgressRecord { file, reason }) => {
                tracing::warn!("Leaving {} out of the report: {}", file, reason);
                continue;
            }
            Err(e) => return Err(e),
        };
        if group_table(&group) != Some(table) {
            continue;
        }
        let pending_targets = configured
            .iter()
            .filter(|t| {
                group
                    .work
                    .get(*t)
                    .map(|p| !is_fully_replicated(p))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        let removable =
            group.validate().is_ok() && removal_decision(&group, &configured).is_remove();
        reports.push(FileReport {
            sequence: group.status.as_ref().map(|s| s.sequence),
            status: group.status.as_ref().map(|s| s.progress),
            file: group.file,
            work: group.work,
            pending_targets,
            removable,
        });
    }
    Ok(reports)
}

/// Wait until every file of `table` that is pending right now has either been
/// garbage collected or become removable. Files registered after the call are
/// not waited for.
///
/// Returns the number of files that were waited on.
pub async fn drain<S: RecordStore + ?Sized>(
    store: &S,
    table: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<usize> {
    let start = Instant::now();
    let waiting: BTreeSet<String> = table_report(store, table)?
        .into_iter()
        .filter(|r| !r.removable)
        .map(|r| r.file)
        .collect();
    tracing::info!("Draining table {}: {} file(s) pending", table, waiting.len());

    loop {
        let pending = table_report(store, table)?
            .iter()
            .filter(|r| waiting.contains(&r.file) && !r.removable)
            .count();
        if pending == 0 {
            tracing::info!("Table {} drained in {:?}", table, start.elapsed());
            return Ok(waiting.len());
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(LedgerError::DrainTimeout {
                table: table.to_string(),
                pending,
                waited,
            });
        }
        tracing::debug!("Table {} still has {} pending file(s)", table, pending);
        tokio::time::sleep(poll_interval.min(timeout - waited)).await;
    }
}
