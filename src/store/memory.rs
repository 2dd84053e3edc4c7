// ABOUTME: In-process record store backed by a BTreeMap
// ABOUTME: Used for embedding and tests; can inject unavailability and delete failures

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    check_work_bound, CreateOutcome, DeleteSink, GroupScan, RecordGroup, RecordKey, RecordStore,
    StatusEntry,
};
use crate::config::{ConfigProvider, ReplicationConfig, StaticConfigProvider};
use crate::error::{LedgerError, Result};
use crate::progress::ProgressRecord;
use crate::target::ReplicationTarget;

/// How an injected delete failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFault {
    /// Reject the whole batch.
    Reject,
    /// Delete the first key of the batch, then fail.
    AfterFirst,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<String, RecordGroup>,
    last_sequence: u64,
    unavailable: bool,
    delete_faults: BTreeMap<String, DeleteFault>,
    flushes: u64,
}

pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
    config: Arc<dyn ConfigProvider>,
}

impl MemoryRecordStore {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn with_config(config: ReplicationConfig) -> Self {
        Self::new(Arc::new(StaticConfigProvider::new(config)))
    }

    /// Replace a file's whole row, bypassing every check. Lets callers seed
    /// arbitrary (including malformed) states.
    pub fn insert_group(&self, group: RecordGroup) {
        let mut inner = self.lock();
        if let Some(status) = &group.status {
            inner.last_sequence = inner.last_sequence.max(status.sequence);
        }
        inner.rows.insert(group.file.clone(), group);
    }

    pub fn group(&self, file: &str) -> Option<RecordGroup> {
        self.lock().rows.get(file).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn record_count(&self) -> usize {
        self.lock().rows.values().map(RecordGroup::record_count).sum()
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn fail_deletes_for(&self, file: &str, fault: DeleteFault) {
        self.lock().delete_faults.insert(file.to_string(), fault);
    }

    pub fn clear_delete_faults(&self) {
        self.lock().delete_faults.clear();
    }

    pub fn flush_count(&self) -> u64 {
        self.lock().flushes
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(LedgerError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(inner)
    }
}

fn remove_key(group: &mut RecordGroup, key: &RecordKey) -> bool {
    match key {
        RecordKey::Status { source_table_id } => {
            let matches = group
                .status
                .as_ref()
                .map(|s| &s.source_table_id == source_table_id)
                .unwrap_or(false);
            if matches {
                group.status = None;
            }
            matches
        }
        RecordKey::Work(target) => group.work.remove(target).is_some(),
    }
}

impl DeleteSink for MemoryRecordStore {
    fn delete_batch(&self, file: &str, keys: &[RecordKey]) -> Result<u64> {
        let mut inner = self.available()?;
        let fault = inner.delete_faults.get(file).copied();
        if fault == Some(DeleteFault::Reject) {
            return Err(LedgerError::StoreUnavailable(format!(
                "delete rejected for {}",
                file
            )));
        }

        let Some(group) = inner.rows.get_mut(file) else {
            return Ok(0);
        };
        let limit = match fault {
            Some(DeleteFault::AfterFirst) => 1,
            _ => keys.len(),
        };
        let mut removed = 0u64;
        for key in keys.iter().take(limit) {
            if remove_key(group, key) {
                removed += 1;
            }
        }
        if group.record_count() == 0 {
            inner.rows.remove(file);
        }

        if fault.is_some() && limit < keys.len() {
            return Err(LedgerError::PartialBatchDeleteFailure {
                removed,
                failed_files: vec![file.to_string()],
            });
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.available()?;
        inner.flushes += 1;
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn scan_grouped_by_file(&self) -> Result<GroupScan<'_>> {
        drop(self.available()?);
        let mut after: Option<String> = None;
        let mut failed = false;
        Ok(Box::new(std::iter::from_fn(move || {
            if failed {
                return None;
            }
            let inner = match self.available() {
                Ok(inner) => inner,
                Err(e) => {
                    failed = true;
                    return Some(Err(e));
                }
            };
            let lower = match &after {
                Some(file) => Bound::Excluded(file.as_str()),
                None => Bound::Unbounded,
            };
            let group = inner
                .rows
                .range::<str, _>((lower, Bound::Unbounded))
                .next()
                .map(|(_, group)| group.clone())?;
            after = Some(group.file.clone());
            Some(Ok(group))
        })))
    }

    fn status_record(&self, file: &str) -> Result<Option<StatusEntry>> {
        Ok(self
            .available()?
            .rows
            .get(file)
            .and_then(|group| group.status.clone()))
    }

    fn create_work_record_if_absent(
        &self,
        file: &str,
        target: &ReplicationTarget,
        initial: ProgressRecord,
    ) -> Result<CreateOutcome> {
        let mut inner = self.available()?;
        let Some(group) = inner.rows.get_mut(file).filter(|g| g.status.is_some()) else {
            return Ok(CreateOutcome::StatusMissing);
        };
        if group.work.contains_key(target) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        check_work_bound(file, target, group.status.as_ref(), &initial)?;
        group.work.insert(target.clone(), initial);
        Ok(CreateOutcome::Created)
    }

    fn record_status(
        &self,
        file: &str,
        source_table_id: &str,
        progress: ProgressRecord,
    ) -> Result<StatusEntry> {
        progress.validate(file)?;
        let mut inner = self.available()?;
        if let Some(existing) = inner.rows.get_mut(file).and_then(|g| g.status.as_mut()) {
            if existing.source_table_id != source_table_id {
                return Err(LedgerError::malformed(
                    file,
                    format!(
                        "already registered for table {}, not {}",
                        existing.source_table_id, source_table_id
                    ),
                ));
            }
            let merged = existing.progress.merge(progress);
            merged.validate(file)?;
            existing.progress = merged;
            return Ok(existing.clone());
        }

        inner.last_sequence += 1;
        let entry = StatusEntry {
            source_table_id: source_table_id.to_string(),
            sequence: inner.last_sequence,
            progress,
        };
        let group = inner.rows.entry(file.to_string()).or_insert_with(|| RecordGroup {
            file: file.to_string(),
            status: None,
            work: BTreeMap::new(),
        });
        group.status = Some(entry.clone());
        Ok(entry)
    }

    fn update_work_record(
        &self,
        file: &str,
        target: &ReplicationTarget,
        progress: ProgressRecord,
    ) -> Result<ProgressRecord> {
        let mut inner = self.available()?;
        let missing = || LedgerError::MissingWorkRecord {
            file: file.to_string(),
            target: target.clone(),
        };
        let group = inner.rows.get_mut(file).ok_or_else(missing)?;
        let current = *group.work.get(target).ok_or_else(missing)?;
        let merged = current.merge(progress);
        check_work_bound(file, target, group.status.as_ref(), &merged)?;
        group.work.insert(target.clone(), merged);
        Ok(merged)
    }

    fn config_provider(&self) -> &dyn ConfigProvider {
        self.config.as_ref()
    }
}
