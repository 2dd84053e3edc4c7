// ABOUTME: Garbage collector for fully replicated record groups
// ABOUTME: Deletes a file's Status and Work records once every configured target has caught up

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{LedgerError, Result};
use crate::progress::is_fully_replicated;
use crate::store::{RecordGroup, RecordStore};
use crate::target::ReplicationTarget;

/// Why a group is kept on this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepReason {
    StatusIncomplete,
    /// A configured target has not been assigned this file yet.
    MissingWork(ReplicationTarget),
    WorkIncomplete(ReplicationTarget),
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepReason::StatusIncomplete => write!(f, "status not fully replicated"),
            KeepReason::MissingWork(target) => write!(f, "no work record for {}", target),
            KeepReason::WorkIncomplete(target) => write!(f, "work for {} still pending", target),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalDecision {
    Remove,
    Keep(KeepReason),
}

impl RemovalDecision {
    pub fn is_remove(&self) -> bool {
        matches!(self, RemovalDecision::Remove)
    }
}

/// Source table a group belongs to. Groups left without a Status record by an
/// interrupted deletion are attributed through their Work records.
pub fn group_table(group: &RecordGroup) -> Option<&str> {
    group.source_table_id().or_else(|| {
        group
            .work
            .keys()
            .next()
            .map(|t| t.source_table_id.as_str())
    })
}

/// Decide whether `group` may be deleted, given the targets currently
/// configured for its source table.
///
/// Work records for targets outside `configured` neither block nor enable
/// removal; they are deleted along with the group.
pub fn removal_decision(
    group: &RecordGroup,
    configured: &BTreeSet<ReplicationTarget>,
) -> RemovalDecision {
    let Some(status) = &group.status else {
        // Remnant of an interrupted deletion: the group was already judged
        // complete, only its Work records are left.
        for (target, progress) in &group.work {
            if configured.contains(target) && !is_fully_replicated(progress) {
                return RemovalDecision::Keep(KeepReason::WorkIncomplete(target.clone()));
            }
        }
        return RemovalDecision::Remove;
    };

    if !is_fully_replicated(&status.progress) {
        return RemovalDecision::Keep(KeepReason::StatusIncomplete);
    }
    for target in configured {
        match group.work.get(target) {
            None => return RemovalDecision::Keep(KeepReason::MissingWork(target.clone())),
            Some(progress) if !is_fully_replicated(progress) => {
                return RemovalDecision::Keep(KeepReason::WorkIncomplete(target.clone()))
            }
            Some(_) => {}
        }
    }
    RemovalDecision::Remove
}

/// Statistics from one garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub groups_scanned: usize,
    pub groups_removed: usize,
    /// Status plus Work records deleted.
    pub records_removed: u64,
    pub malformed_groups: usize,
    pub duration_ms: u64,
}

/// Configured targets per source table, read once per pass.
struct TargetCache<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    tables: BTreeMap<String, BTreeSet<ReplicationTarget>>,
}

impl<'a, S: RecordStore + ?Sized> TargetCache<'a, S> {
    fn new(store: &'a S) -> Self {
        Self {
            store,
            tables: BTreeMap::new(),
        }
    }

    fn get(&mut self, table: &str) -> Result<&BTreeSet<ReplicationTarget>> {
        if !self.tables.contains_key(table) {
            let targets = self.store.list_configured_targets(table)?;
            self.tables.insert(table.to_string(), targets);
        }
        self.tables
            .get(table)
            .ok_or_else(|| LedgerError::Config(format!("no targets cached for table {}", table)))
    }
}

pub struct GarbageCollector<S: RecordStore> {
    store: Arc<S>,
}

impl<S: RecordStore> GarbageCollector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Delete every eligible group from `groups`.
    ///
    /// Malformed groups are logged and skipped. A store failure while reading
    /// aborts the pass. Delete failures do not stop the scan; they are
    /// reported together at the end as `PartialBatchDeleteFailure`, which
    /// carries the number of records that were removed anyway.
    pub fn remove_complete_records<I>(&self, groups: I) -> Result<GcStats>
    where
        I: IntoIterator<Item = Result<RecordGroup>>,
    {
        let start = Instant::now();
        let mut stats = GcStats::default();
        let mut failed_files = Vec::new();
        let mut targets = TargetCache::new(self.store.as_ref());

        for item in groups {
            let group = match item {
                Ok(group) => group,
                Err(LedgerError::MalformedProgressRecord { file, reason }) => {
                    tracing::warn!("Skipping malformed record group {}: {}", file, reason);
                    stats.malformed_groups += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            stats.groups_scanned += 1;

            if let Err(e) = group.validate() {
                tracing::warn!("Skipping record group {}: {}", group.file, e);
                stats.malformed_groups += 1;
                continue;
            }
            let Some(table) = group_table(&group) else {
                continue;
            };

            match removal_decision(&group, targets.get(table)?) {
                RemovalDecision::Keep(reason) => {
                    if group.status.is_none() {
                        tracing::warn!(
                            "Leaving partially deleted group {} in place: {}",
                            group.file,
                            reason
                        );
                    } else {
                        tracing::debug!("Keeping {}: {}", group.file, reason);
                    }
                }
                RemovalDecision::Remove => {
                    let keys = group.record_keys();
                    match self.store.delete_batch(&group.file, &keys) {
                        Ok(removed) => {
                            tracing::debug!("Removed {} record(s) for {}", removed, group.file);
                            stats.groups_removed += 1;
                            stats.records_removed += removed;
                        }
                        Err(LedgerError::PartialBatchDeleteFailure { removed, .. }) => {
                            tracing::warn!(
                                "Deleted only {} of {} record(s) for {}",
                                removed,
                                keys.len(),
                                group.file
                            );
                            stats.records_removed += removed;
                            failed_files.push(group.file);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to delete records for {}: {}", group.file, e);
                            failed_files.push(group.file);
                        }
                    }
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        if !failed_files.is_empty() {
            return Err(LedgerError::PartialBatchDeleteFailure {
                removed: stats.records_removed,
                failed_files,
            });
        }
        Ok(stats)
    }

    /// Scan the whole store, remove what is complete, and flush deletions.
    pub fn run_pass(&self) -> Result<GcStats> {
        let groups = self.store.scan_grouped_by_file()?;
        let result = self.remove_complete_records(groups);
        let flushed = self.store.flush();
        let stats = result?;
        flushed?;

        tracing::info!(
            "Garbage collection pass: {} group(s) scanned, {} removed ({} records), {} malformed in {}ms",
            stats.groups_scanned,
            stats.groups_removed,
            stats.records_removed,
            stats.malformed_groups,
            stats.duration_ms
        );
        Ok(stats)
    }
}
