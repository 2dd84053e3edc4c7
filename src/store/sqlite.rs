// ABOUTME: Record store backed by the ledger-table SQLite cell table
// ABOUTME: One row per file; a status cell per source table and a work cell per target

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ledger_table::{Cell, InsertOutcome, LedgerTable};
use serde::{Deserialize, Serialize};

use super::{
    check_work_bound, CreateOutcome, DeleteSink, GroupScan, RecordGroup, RecordKey, RecordStore,
    RowGroups, StatusEntry,
};
use crate::config::ConfigProvider;
use crate::error::{LedgerError, Result};
use crate::progress::ProgressRecord;
use crate::target::ReplicationTarget;

const STATUS_FAMILY: &str = "status";
const WORK_FAMILY: &str = "work";
const STATUS_SEQUENCE: &str = "status";
/// Rows fetched per scan page.
const SCAN_PAGE_ROWS: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct StatusCell {
    sequence: u64,
    #[serde(flatten)]
    progress: ProgressRecord,
}

pub struct SqliteRecordStore {
    table: LedgerTable,
    config: Arc<dyn ConfigProvider>,
    page_rows: usize,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>, config: Arc<dyn ConfigProvider>) -> Result<Self> {
        let table = LedgerTable::open(path)?;
        Ok(Self {
            table,
            config,
            page_rows: SCAN_PAGE_ROWS,
        })
    }

    /// Number of files read per page while scanning.
    pub fn with_page_rows(mut self, rows: usize) -> Self {
        self.page_rows = rows.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        self.table.path()
    }

    /// Number of stored records across all files.
    pub fn record_count(&self) -> Result<u64> {
        Ok(self.table.len()?)
    }

    fn status_of(&self, file: &str) -> Result<Option<StatusEntry>> {
        single_status(file, &self.table.scan_row(file)?)
    }
}

/// Whole rows of the table in key order, fetched one page at a time.
struct PagedRows<'a> {
    table: &'a LedgerTable,
    page_rows: usize,
    after: Option<String>,
    page: std::vec::IntoIter<Vec<Cell>>,
    exhausted: bool,
}

impl<'a> PagedRows<'a> {
    fn new(table: &'a LedgerTable, page_rows: usize) -> Self {
        Self {
            table,
            page_rows,
            after: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }
}

impl Iterator for PagedRows<'_> {
    type Item = Result<Vec<Cell>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.page.next() {
                return Some(Ok(row));
            }
            if self.exhausted {
                return None;
            }
            let cells = match self.table.scan_page(self.after.as_deref(), self.page_rows) {
                Ok(cells) => cells,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            };
            let rows: Vec<Vec<Cell>> = RowGroups::new(cells.into_iter(), cell_row).collect();
            match rows.last().and_then(|row| row.first()) {
                Some(cell) => self.after = Some(cell.row.clone()),
                None => return None,
            }
            self.exhausted = rows.len() < self.page_rows;
            tracing::trace!(rows = rows.len(), "fetched scan page");
            self.page = rows.into_iter();
        }
    }
}

fn key_column(key: &RecordKey) -> (String, String) {
    match key {
        RecordKey::Status { source_table_id } => {
            (STATUS_FAMILY.to_string(), source_table_id.clone())
        }
        RecordKey::Work(target) => (WORK_FAMILY.to_string(), target.to_qualifier()),
    }
}

fn cell_row(cell: &Cell) -> &str {
    &cell.row
}

fn encode<T: Serialize>(file: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| LedgerError::malformed(file, e.to_string()))
}

fn decode_status(file: &str, cell: &Cell) -> Result<StatusEntry> {
    let decoded: StatusCell = serde_json::from_slice(&cell.value)
        .map_err(|e| LedgerError::malformed(file, format!("undecodable status: {}", e)))?;
    Ok(StatusEntry {
        source_table_id: cell.qualifier.clone(),
        sequence: decoded.sequence,
        progress: decoded.progress,
    })
}

/// The one Status record among `cells`, if any. Cells of other families are
/// ignored.
fn single_status(file: &str, cells: &[Cell]) -> Result<Option<StatusEntry>> {
    let mut statuses = cells.iter().filter(|c| c.family == STATUS_FAMILY);
    let Some(cell) = statuses.next() else {
        return Ok(None);
    };
    if statuses.next().is_some() {
        return Err(LedgerError::malformed(file, "multiple status records"));
    }
    decode_status(file, cell).map(Some)
}

fn decode_work(file: &str, cell: &Cell) -> Result<(ReplicationTarget, ProgressRecord)> {
    let target = ReplicationTarget::from_qualifier(&cell.qualifier).map_err(|e| {
        LedgerError::malformed(
            file,
            format!("undecodable target {:?}: {}", cell.qualifier, e),
        )
    })?;
    let progress: ProgressRecord = serde_json::from_slice(&cell.value).map_err(|e| {
        LedgerError::malformed(file, format!("undecodable work for {}: {}", target, e))
    })?;
    Ok((target, progress))
}

/// Assemble one row's cells into a group. Any undecodable cell poisons only
/// this row.
fn decode_row(cells: Vec<Cell>) -> Result<RecordGroup> {
    let file = cells.first().map(|c| c.row.clone()).unwrap_or_default();
    let mut status: Option<StatusEntry> = None;
    let mut work = BTreeMap::new();
    for cell in &cells {
        match cell.family.as_str() {
            STATUS_FAMILY => {
                if status.is_some() {
                    return Err(LedgerError::malformed(&file, "multiple status records"));
                }
                status = Some(decode_status(&file, cell)?);
            }
            WORK_FAMILY => {
                let (target, progress) = decode_work(&file, cell)?;
                work.insert(target, progress);
            }
            other => {
                tracing::debug!(file = %file, family = other, "ignoring unknown column family");
            }
        }
    }
    Ok(RecordGroup { file, status, work })
}

impl DeleteSink for SqliteRecordStore {
    fn delete_batch(&self, file: &str, keys: &[RecordKey]) -> Result<u64> {
        let columns: Vec<(String, String)> = keys.iter().map(key_column).collect();
        Ok(self.table.delete_cells(file, &columns)?)
    }
}

impl RecordStore for SqliteRecordStore {
    fn scan_grouped_by_file(&self) -> Result<GroupScan<'_>> {
        let rows = PagedRows::new(&self.table, self.page_rows);
        Ok(Box::new(rows.map(|row| row.and_then(decode_row))))
    }

    fn status_record(&self, file: &str) -> Result<Option<StatusEntry>> {
        self.status_of(file)
    }

    fn create_work_record_if_absent(
        &self,
        file: &str,
        target: &ReplicationTarget,
        initial: ProgressRecord,
    ) -> Result<CreateOutcome> {
        check_work_bound(file, target, self.status_of(file)?.as_ref(), &initial)?;
        let cell = Cell::new(
            file,
            WORK_FAMILY,
            target.to_qualifier(),
            encode(file, &initial)?,
        );
        let outcome = match self.table.insert_into_row_if_absent(&cell, STATUS_FAMILY)? {
            InsertOutcome::Inserted => CreateOutcome::Created,
            InsertOutcome::AlreadyPresent => CreateOutcome::AlreadyExists,
            InsertOutcome::RowMissing => CreateOutcome::StatusMissing,
        };
        Ok(outcome)
    }

    fn record_status(
        &self,
        file: &str,
        source_table_id: &str,
        progress: ProgressRecord,
    ) -> Result<StatusEntry> {
        progress.validate(file)?;
        let mut written: Option<StatusEntry> = None;
        self.table
            .modify::<_, LedgerError>(file, STATUS_FAMILY, source_table_id, |current, update| {
                let statuses = update.family_cells(STATUS_FAMILY)?;
                if let Some(other) = statuses.iter().find(|c| c.qualifier != source_table_id) {
                    return Err(LedgerError::malformed(
                        file,
                        format!(
                            "already registered for table {}, not {}",
                            other.qualifier, source_table_id
                        ),
                    ));
                }
                let entry = match current {
                    Some(bytes) => {
                        let cell = Cell::new(file, STATUS_FAMILY, source_table_id, bytes.to_vec());
                        let existing = decode_status(file, &cell)?;
                        let merged = existing.progress.merge(progress);
                        merged.validate(file)?;
                        StatusEntry {
                            progress: merged,
                            ..existing
                        }
                    }
                    None => StatusEntry {
                        source_table_id: source_table_id.to_string(),
                        sequence: update.next_sequence(STATUS_SEQUENCE)?,
                        progress,
                    },
                };
                let value = encode(
                    file,
                    &StatusCell {
                        sequence: entry.sequence,
                        progress: entry.progress,
                    },
                )?;
                written = Some(entry);
                Ok(Some(value))
            })?;
        written.ok_or_else(|| {
            LedgerError::StoreUnavailable(format!("status write for {} was dropped", file))
        })
    }

    fn update_work_record(
        &self,
        file: &str,
        target: &ReplicationTarget,
        progress: ProgressRecord,
    ) -> Result<ProgressRecord> {
        let qualifier = target.to_qualifier();
        let mut merged: Option<ProgressRecord> = None;
        self.table.modify::<_, LedgerError>(file, WORK_FAMILY, &qualifier, |current, update| {
            let Some(bytes) = current else {
                return Err(LedgerError::MissingWorkRecord {
                    file: file.to_string(),
                    target: target.clone(),
                });
            };
            let cell = Cell::new(file, WORK_FAMILY, qualifier.as_str(), bytes.to_vec());
            let (_, existing) = decode_work(file, &cell)?;
            let next = existing.merge(progress);
            let status = single_status(file, &update.family_cells(STATUS_FAMILY)?)?;
            check_work_bound(file, target, status.as_ref(), &next)?;
            merged = Some(next);
            Ok(Some(encode(file, &next)?))
        })?;
        merged.ok_or_else(|| {
            LedgerError::StoreUnavailable(format!("work write for {} was dropped", file))
        })
    }

    fn config_provider(&self) -> &dyn ConfigProvider {
        self.config.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assigner::{SequentialWorkAssigner, TargetState};
    use crate::config::{ReplicationConfig, StaticConfigProvider};
    use chrono::Utc;
    use std::thread;
    use tempfile::tempdir;

    fn open(dir: &Path) -> SqliteRecordStore {
        let mut config = ReplicationConfig::default();
        config.add_target("1", "peer1", "5");
        SqliteRecordStore::open(
            dir.join("ledger.db"),
            Arc::new(StaticConfigProvider::new(config)),
        )
        .unwrap()
    }

    fn open_two_peers(dir: &Path) -> Arc<SqliteRecordStore> {
        let mut config = ReplicationConfig::default();
        config.add_target("1", "peer1", "5");
        config.add_target("1", "peer2", "6");
        Arc::new(
            SqliteRecordStore::open(
                dir.join("ledger.db"),
                Arc::new(StaticConfigProvider::new(config)),
            )
            .unwrap(),
        )
    }

    fn assigned_files(store: &SqliteRecordStore) -> Vec<(String, usize)> {
        store
            .scan_grouped_by_file()
            .unwrap()
            .filter_map(|group| group.ok())
            .map(|group| (group.file, group.work.len()))
            .collect()
    }

    #[test]
    fn test_decode_row_rejects_two_status_cells() {
        let status = serde_json::to_vec(&StatusCell {
            sequence: 1,
            progress: ProgressRecord::file_closed(1),
        })
        .unwrap();
        let cells = vec![
            Cell::new("/wal/a", STATUS_FAMILY, "1", status.clone()),
            Cell::new("/wal/a", STATUS_FAMILY, "2", status),
        ];
        assert!(matches!(
            decode_row(cells),
            Err(LedgerError::MalformedProgressRecord { .. })
        ));
    }

    #[test]
    fn test_status_cell_layout_is_flat() {
        let value = serde_json::to_value(StatusCell {
            sequence: 3,
            progress: ProgressRecord::file_closed(10),
        })
        .unwrap();
        assert_eq!(value["sequence"], 3);
        assert_eq!(value["end"], 10);
        assert_eq!(value["closed"], true);
    }

    #[test]
    fn test_undecodable_row_is_isolated() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store
            .record_status("/wal/a", "1", ProgressRecord::file_closed(10))
            .unwrap();
        store
            .table
            .put(&Cell::new("/wal/b", STATUS_FAMILY, "1", b"not json".to_vec()))
            .unwrap();
        store
            .record_status("/wal/c", "1", ProgressRecord::file_closed(10))
            .unwrap();

        let results: Vec<Result<RecordGroup>> = store.scan_grouped_by_file().unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(LedgerError::MalformedProgressRecord { ref file, .. }) if file == "/wal/b"
        ));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_undecodable_work_cell_holds_later_files() {
        let dir = tempdir().unwrap();
        let store = open_two_peers(dir.path());
        store
            .record_status("/wal/f1", "1", ProgressRecord::file_closed(100))
            .unwrap();
        store
            .record_status("/wal/f2", "1", ProgressRecord::file_closed(100))
            .unwrap();

        let assigner = SequentialWorkAssigner::new(store.clone());
        let report = assigner.tick(Utc::now()).unwrap();
        assert_eq!(report.work_created.len(), 2);
        assert!(report.work_created.iter().all(|(_, file)| file == "/wal/f1"));

        store
            .table
            .put(&Cell::new("/wal/f1", WORK_FAMILY, "garbage", b"junk".to_vec()))
            .unwrap();

        let report = assigner.tick(Utc::now()).unwrap();
        assert!(report.work_created.is_empty());
        for peer in [("peer1", "5"), ("peer2", "6")] {
            let target = ReplicationTarget::new(peer.0, peer.1, "1");
            assert_eq!(
                report.states[&target],
                TargetState::Blocked {
                    file: "/wal/f1".to_string()
                }
            );
        }
        assert_eq!(assigned_files(&store), vec![("/wal/f2".to_string(), 0)]);
        assert!(assigner.in_flight().is_empty());
    }

    #[test]
    fn test_undecodable_status_cell_holds_every_table() {
        let dir = tempdir().unwrap();
        let store = open_two_peers(dir.path());
        store
            .table
            .put(&Cell::new("/wal/f0", STATUS_FAMILY, "1", b"junk".to_vec()))
            .unwrap();
        store
            .record_status("/wal/f1", "1", ProgressRecord::file_closed(100))
            .unwrap();

        let assigner = SequentialWorkAssigner::new(store.clone());
        let report = assigner.tick(Utc::now()).unwrap();
        assert!(report.work_created.is_empty());
        assert_eq!(
            report.states[&ReplicationTarget::new("peer1", "5", "1")],
            TargetState::Blocked {
                file: "/wal/f0".to_string()
            }
        );
        assert_eq!(assigned_files(&store), vec![("/wal/f1".to_string(), 0)]);

        store
            .table
            .delete_cells("/wal/f0", &[(STATUS_FAMILY.to_string(), "1".to_string())])
            .unwrap();
        let report = assigner.tick(Utc::now()).unwrap();
        assert_eq!(report.work_created.len(), 2);
    }

    #[test]
    fn test_scan_spans_several_pages() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).with_page_rows(2);
        let target = ReplicationTarget::new("peer1", "5", "1");
        for i in 0..5 {
            let file = format!("/wal/{}", i);
            store
                .record_status(&file, "1", ProgressRecord::file_closed(10))
                .unwrap();
            store
                .create_work_record_if_absent(&file, &target, ProgressRecord::file_closed(10))
                .unwrap();
        }

        let groups: Vec<RecordGroup> = store
            .scan_grouped_by_file()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let files: Vec<&str> = groups.iter().map(|g| g.file.as_str()).collect();
        assert_eq!(files, vec!["/wal/0", "/wal/1", "/wal/2", "/wal/3", "/wal/4"]);
        assert!(groups
            .iter()
            .all(|g| g.status.is_some() && g.work.len() == 1));
    }

    #[test]
    fn test_concurrent_registration_keeps_one_status_per_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let config: Arc<dyn ConfigProvider> =
            Arc::new(StaticConfigProvider::new(ReplicationConfig::default()));
        let first = SqliteRecordStore::open(&path, config.clone()).unwrap();
        let second = SqliteRecordStore::open(&path, config).unwrap();

        let register = |store: SqliteRecordStore, table: &'static str| {
            thread::spawn(move || {
                (0..50)
                    .filter(|i| {
                        store
                            .record_status(
                                &format!("/wal/{}", i),
                                table,
                                ProgressRecord::file_closed(10),
                            )
                            .is_ok()
                    })
                    .count()
            })
        };
        let a = register(first, "1");
        let b = register(second, "2");
        let registered = a.join().unwrap() + b.join().unwrap();
        assert_eq!(registered, 50);

        let store = open(dir.path());
        let groups: Vec<RecordGroup> = store
            .scan_grouped_by_file()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(groups.len(), 50);
    }
}
