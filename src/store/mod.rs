// ABOUTME: Record store contract: per-file groups of Status and Work records
// ABOUTME: Read/write/scan primitives consumed by the garbage collector and assigner

pub mod memory;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet};
use std::iter::Peekable;

use crate::config::ConfigProvider;
use crate::error::{LedgerError, Result};
use crate::progress::ProgressRecord;
use crate::target::ReplicationTarget;

pub use memory::MemoryRecordStore;
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteRecordStore;

/// Addresses one record inside a file's group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Status { source_table_id: String },
    Work(ReplicationTarget),
}

/// The source-side record of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub source_table_id: String,
    /// Strictly increasing creation order, assigned when the record is first written.
    pub sequence: u64,
    pub progress: ProgressRecord,
}

/// Every record stored for one file, as a single read-consistent unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordGroup {
    pub file: String,
    pub status: Option<StatusEntry>,
    pub work: BTreeMap<ReplicationTarget, ProgressRecord>,
}

impl RecordGroup {
    pub fn new(file: impl Into<String>, status: StatusEntry) -> Self {
        Self {
            file: file.into(),
            status: Some(status),
            work: BTreeMap::new(),
        }
    }

    pub fn with_work(mut self, target: ReplicationTarget, progress: ProgressRecord) -> Self {
        self.work.insert(target, progress);
        self
    }

    pub fn source_table_id(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.source_table_id.as_str())
    }

    /// Keys of every record in the group, Status first.
    ///
    /// Deleting in this order means an interrupted deletion can only leave
    /// Work records behind, never a Status record without its Work records.
    pub fn record_keys(&self) -> Vec<RecordKey> {
        let mut keys = Vec::with_capacity(self.record_count());
        if let Some(status) = &self.status {
            keys.push(RecordKey::Status {
                source_table_id: status.source_table_id.clone(),
            });
        }
        keys.extend(self.work.keys().cloned().map(RecordKey::Work));
        keys
    }

    pub fn record_count(&self) -> usize {
        usize::from(self.status.is_some()) + self.work.len()
    }

    /// Check per-record invariants and the cross-record bound that no Work
    /// record may have read past the end of a closed source file.
    pub fn validate(&self) -> Result<()> {
        if let Some(status) = &self.status {
            status.progress.validate(&self.file)?;
        }
        for (target, progress) in &self.work {
            check_work_bound(&self.file, target, self.status.as_ref(), progress)?;
        }
        Ok(())
    }
}

/// Outcome of [`RecordStore::create_work_record_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    /// The file's Status record is gone (already garbage collected).
    StatusMissing,
}

pub type GroupScan<'a> = Box<dyn Iterator<Item = Result<RecordGroup>> + 'a>;

/// Batched key deletion with an explicit flush boundary.
pub trait DeleteSink {
    /// Delete `keys` from `file`'s group. Returns how many records were removed.
    fn delete_batch(&self, file: &str, keys: &[RecordKey]) -> Result<u64>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// The persistence substrate for replication records.
pub trait RecordStore: DeleteSink {
    /// Every file's records, grouped so that each item is a whole row.
    fn scan_grouped_by_file(&self) -> Result<GroupScan<'_>>;

    /// The Status record of one file, read on its own. Lets callers place a
    /// file whose full group failed to decode.
    fn status_record(&self, file: &str) -> Result<Option<StatusEntry>>;

    /// Create a Work record for `target` only if none exists. Never overwrites.
    fn create_work_record_if_absent(
        &self,
        file: &str,
        target: &ReplicationTarget,
        initial: ProgressRecord,
    ) -> Result<CreateOutcome>;

    /// Create the Status record of a newly registered file, or merge `progress`
    /// into the existing one.
    fn record_status(
        &self,
        file: &str,
        source_table_id: &str,
        progress: ProgressRecord,
    ) -> Result<StatusEntry>;

    /// Merge a shipping worker's progress into an existing Work record.
    fn update_work_record(
        &self,
        file: &str,
        target: &ReplicationTarget,
        progress: ProgressRecord,
    ) -> Result<ProgressRecord>;

    fn config_provider(&self) -> &dyn ConfigProvider;

    fn list_configured_targets(&self, table: &str) -> Result<BTreeSet<ReplicationTarget>> {
        Ok(self.config_provider().current()?.targets_for(table))
    }

    fn replicated_tables(&self) -> Result<Vec<String>> {
        Ok(self.config_provider().current()?.replicated_tables())
    }
}

/// Reject Work progress that has moved past a closed source file's end.
pub(crate) fn check_work_bound(
    file: &str,
    target: &ReplicationTarget,
    status: Option<&StatusEntry>,
    merged: &ProgressRecord,
) -> Result<()> {
    merged.validate(file)?;
    if let Some(status) = status {
        let bound = status.progress;
        if bound.closed && !bound.infinite_end && merged.begin > bound.end {
            return Err(LedgerError::malformed(
                file,
                format!(
                    "work for {} begins at {} past closed end {}",
                    target, merged.begin, bound.end
                ),
            ));
        }
    }
    Ok(())
}

/// Splits a row-sorted iterator into runs that share a row key, turning a
/// sorted scan into whole-row units.
pub struct RowGroups<I: Iterator> {
    inner: Peekable<I>,
    row_of: fn(&I::Item) -> &str,
}

impl<I: Iterator> RowGroups<I> {
    pub fn new(inner: I, row_of: fn(&I::Item) -> &str) -> Self {
        Self {
            inner: inner.peekable(),
            row_of,
        }
    }
}

impl<I: Iterator> Iterator for RowGroups<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.inner.next()?;
        let row_of = self.row_of;
        let row = row_of(&first).to_string();
        let mut run = vec![first];
        while let Some(item) = self.inner.next_if(|item| row_of(item) == row) {
            run.push(item);
        }
        Some(run)
    }
}
