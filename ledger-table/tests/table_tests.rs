use ledger_table::{Cell, LedgerTable, TableError};
use tempfile::tempdir;

fn status_cell(row: &str, value: &str) -> Cell {
    Cell::new(row, "status", "1", value.as_bytes().to_vec())
}

#[test]
fn scan_returns_cells_in_row_family_qualifier_order() {
    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();

    table.put(&Cell::new("/wal/b", "work", "peer2", b"w".to_vec())).unwrap();
    table.put(&status_cell("/wal/b", "s")).unwrap();
    table.put(&Cell::new("/wal/a", "work", "peer1", b"w".to_vec())).unwrap();
    table.put(&status_cell("/wal/a", "s")).unwrap();

    let cells = table.scan_page(None, 10).unwrap();
    let coords: Vec<(&str, &str)> = cells
        .iter()
        .map(|c| (c.row.as_str(), c.family.as_str()))
        .collect();
    assert_eq!(
        coords,
        vec![
            ("/wal/a", "status"),
            ("/wal/a", "work"),
            ("/wal/b", "status"),
            ("/wal/b", "work"),
        ]
    );
}

#[test]
fn put_overwrites_and_insert_if_absent_does_not() {
    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();

    assert!(table.insert_if_absent(&status_cell("/wal/a", "first")).unwrap());
    assert!(!table.insert_if_absent(&status_cell("/wal/a", "second")).unwrap());
    assert_eq!(
        table.get("/wal/a", "status", "1").unwrap().unwrap(),
        b"first".to_vec()
    );

    table.put(&status_cell("/wal/a", "third")).unwrap();
    assert_eq!(
        table.get("/wal/a", "status", "1").unwrap().unwrap(),
        b"third".to_vec()
    );
    assert_eq!(table.len().unwrap(), 1);
}

#[test]
fn delete_cells_counts_only_existing_cells() {
    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();
    table.put(&status_cell("/wal/a", "s")).unwrap();
    table.put(&Cell::new("/wal/a", "work", "peer1", b"w".to_vec())).unwrap();
    table.put(&status_cell("/wal/b", "s")).unwrap();

    let deleted = table
        .delete_cells(
            "/wal/a",
            &[
                ("status".to_string(), "1".to_string()),
                ("work".to_string(), "peer1".to_string()),
                ("work".to_string(), "missing".to_string()),
            ],
        )
        .unwrap();
    assert_eq!(deleted, 2);
    assert!(table.scan_row("/wal/a").unwrap().is_empty());
    assert_eq!(table.scan_row("/wal/b").unwrap().len(), 1);
}

#[test]
fn modify_reads_current_value_and_can_skip_the_write() {
    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();

    let written = table
        .modify::<_, TableError>("/wal/a", "status", "1", |current, _| {
            assert!(current.is_none());
            Ok(Some(b"one".to_vec()))
        })
        .unwrap();
    assert!(written);

    let written = table
        .modify::<_, TableError>("/wal/a", "status", "1", |current, _| {
            assert_eq!(current, Some(&b"one"[..]));
            Ok(None)
        })
        .unwrap();
    assert!(!written);
    assert_eq!(
        table.get("/wal/a", "status", "1").unwrap().unwrap(),
        b"one".to_vec()
    );
}

#[test]
fn sequences_increase_and_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let table = LedgerTable::open(&path).unwrap();

    assert_eq!(table.next_sequence("status").unwrap(), 1);
    assert_eq!(table.next_sequence("status").unwrap(), 2);
    assert_eq!(table.next_sequence("other").unwrap(), 1);

    let allocated = table
        .modify::<_, TableError>("/wal/a", "status", "1", |_, update| {
            let seq = update.next_sequence("status")?;
            Ok(Some(seq.to_string().into_bytes()))
        })
        .unwrap();
    assert!(allocated);
    drop(table);

    let table = LedgerTable::open(&path).unwrap();
    assert_eq!(
        table.get("/wal/a", "status", "1").unwrap().unwrap(),
        b"3".to_vec()
    );
    assert_eq!(table.next_sequence("status").unwrap(), 4);
}

#[test]
fn guarded_insert_requires_the_guard_family() {
    use ledger_table::InsertOutcome;

    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();
    let work = Cell::new("/wal/a", "work", "peer1", b"w".to_vec());

    assert_eq!(
        table.insert_into_row_if_absent(&work, "status").unwrap(),
        InsertOutcome::RowMissing
    );
    assert!(table.is_empty().unwrap());

    table.put(&status_cell("/wal/a", "s")).unwrap();
    assert_eq!(
        table.insert_into_row_if_absent(&work, "status").unwrap(),
        InsertOutcome::Inserted
    );
    assert_eq!(
        table.insert_into_row_if_absent(&work, "status").unwrap(),
        InsertOutcome::AlreadyPresent
    );
    assert_eq!(table.len().unwrap(), 2);
}

#[test]
fn scan_pages_end_on_whole_rows() {
    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();
    for row in ["/wal/a", "/wal/b", "/wal/c"] {
        table.put(&status_cell(row, "s")).unwrap();
        table.put(&Cell::new(row, "work", "peer1", b"w".to_vec())).unwrap();
        table.put(&Cell::new(row, "work", "peer2", b"w".to_vec())).unwrap();
    }

    let first = table.scan_page(None, 2).unwrap();
    assert_eq!(first.len(), 6);
    assert_eq!(first.last().unwrap().row, "/wal/b");

    let second = table.scan_page(Some("/wal/b"), 2).unwrap();
    assert_eq!(second.len(), 3);
    assert!(second.iter().all(|c| c.row == "/wal/c"));

    assert!(table.scan_page(Some("/wal/c"), 2).unwrap().is_empty());
}

#[test]
fn modify_sees_sibling_cells_of_the_row() {
    let dir = tempdir().unwrap();
    let table = LedgerTable::open(dir.path().join("ledger.db")).unwrap();
    table.put(&status_cell("/wal/a", "s")).unwrap();
    table.put(&status_cell("/wal/b", "s")).unwrap();

    table
        .modify::<_, TableError>("/wal/a", "work", "peer1", |_, update| {
            let statuses = update.family_cells("status")?;
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].row, "/wal/a");
            assert!(update.family_cells("work")?.is_empty());
            Ok(Some(b"w".to_vec()))
        })
        .unwrap();
    assert_eq!(table.scan_row("/wal/a").unwrap().len(), 2);
}
