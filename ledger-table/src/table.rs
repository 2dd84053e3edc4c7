use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Result, TableError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cells (
    row_key     TEXT NOT NULL,
    family      TEXT NOT NULL,
    qualifier   TEXT NOT NULL,
    value       BLOB NOT NULL,
    updated_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (row_key, family, qualifier)
);

CREATE TABLE IF NOT EXISTS sequences (
    name   TEXT PRIMARY KEY,
    value  INTEGER NOT NULL
);
"#;

/// One versionless cell of the table. Cells sort by `(row, family, qualifier)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: String,
    pub family: String,
    pub qualifier: String,
    pub value: Vec<u8>,
}

impl Cell {
    pub fn new(
        row: impl Into<String>,
        family: impl Into<String>,
        qualifier: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
        }
    }
}

/// Result of [`LedgerTable::insert_into_row_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    /// The row had no cell in the guard family, so nothing was written.
    RowMissing,
}

/// Handle passed to [`LedgerTable::modify`] callbacks. Everything done through it
/// commits or rolls back together with the cell write.
pub struct CellUpdate<'a> {
    conn: &'a Connection,
    row: &'a str,
}

impl CellUpdate<'_> {
    pub fn next_sequence(&self, name: &str) -> Result<u64> {
        next_sequence_in(self.conn, name)
    }

    /// Cells of `family` in the row being modified, read inside the same
    /// transaction, ordered by qualifier.
    pub fn family_cells(&self, family: &str) -> Result<Vec<Cell>> {
        let mut stmt = self.conn.prepare(
            "SELECT row_key, family, qualifier, value
             FROM cells
             WHERE row_key = ?1 AND family = ?2
             ORDER BY qualifier ASC",
        )?;
        let cells = stmt
            .query_map(params![self.row, family], row_to_cell)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cells)
    }
}

pub struct LedgerTable {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl LedgerTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| TableError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "opened ledger table");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Insert or overwrite a cell.
    pub fn put(&self, cell: &Cell) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cells(row_key, family, qualifier, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(row_key, family, qualifier) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP",
            params![cell.row, cell.family, cell.qualifier, cell.value],
        )?;
        Ok(())
    }

    /// Write the cell only when no cell exists at its coordinates. Returns
    /// whether the write happened.
    pub fn insert_if_absent(&self, cell: &Cell) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO cells(row_key, family, qualifier, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![cell.row, cell.family, cell.qualifier, cell.value],
        )?;
        Ok(inserted == 1)
    }

    /// Like [`insert_if_absent`](Self::insert_if_absent), but only while the
    /// row still holds at least one cell of `guard_family`. Check and write run
    /// in one immediate transaction.
    pub fn insert_into_row_if_absent(
        &self,
        cell: &Cell,
        guard_family: &str,
    ) -> Result<InsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let guarded: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM cells WHERE row_key = ?1 AND family = ?2)",
            params![cell.row, guard_family],
            |r| r.get(0),
        )?;
        if !guarded {
            return Ok(InsertOutcome::RowMissing);
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO cells(row_key, family, qualifier, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![cell.row, cell.family, cell.qualifier, cell.value],
        )?;
        tx.commit()?;
        Ok(if inserted == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        })
    }

    pub fn get(&self, row: &str, family: &str, qualifier: &str) -> Result<Option<Vec<u8>>> {
        self.conn()
            .query_row(
                "SELECT value FROM cells
                 WHERE row_key = ?1 AND family = ?2 AND qualifier = ?3",
                params![row, family, qualifier],
                |r| r.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Read-modify-write a single cell under an immediate transaction.
    ///
    /// `f` receives the current value, if any, and returns the value to store;
    /// `None` leaves the cell untouched. Returns whether a value was written.
    pub fn modify<F, E>(
        &self,
        row: &str,
        family: &str,
        qualifier: &str,
        f: F,
    ) -> std::result::Result<bool, E>
    where
        F: FnOnce(Option<&[u8]>, &CellUpdate<'_>) -> std::result::Result<Option<Vec<u8>>, E>,
        E: From<TableError>,
    {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(TableError::from)?;
        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM cells
                 WHERE row_key = ?1 AND family = ?2 AND qualifier = ?3",
                params![row, family, qualifier],
                |r| r.get(0),
            )
            .optional()
            .map_err(TableError::from)?;

        let update = CellUpdate { conn: &tx, row };
        let Some(next) = f(current.as_deref(), &update)? else {
            return Ok(false);
        };

        tx.execute(
            "INSERT INTO cells(row_key, family, qualifier, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(row_key, family, qualifier) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP",
            params![row, family, qualifier, next],
        )
        .map_err(TableError::from)?;
        tx.commit().map_err(TableError::from)?;
        Ok(true)
    }

    /// Cells of at most `max_rows` whole rows whose key sorts after `after`
    /// (from the first row when `None`), in `(row, family, qualifier)` order.
    ///
    /// Each page is read by one statement, so no row is ever split across
    /// pages or observed half-written. An empty page means the scan is done.
    pub fn scan_page(&self, after: Option<&str>, max_rows: usize) -> Result<Vec<Cell>> {
        let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT row_key, family, qualifier, value
             FROM cells
             WHERE row_key IN (
                 SELECT DISTINCT row_key FROM cells
                 WHERE ?1 IS NULL OR row_key > ?1
                 ORDER BY row_key ASC
                 LIMIT ?2
             )
             ORDER BY row_key ASC, family ASC, qualifier ASC",
        )?;
        let cells = stmt
            .query_map(params![after, limit], row_to_cell)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cells)
    }

    pub fn scan_row(&self, row: &str) -> Result<Vec<Cell>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT row_key, family, qualifier, value
             FROM cells
             WHERE row_key = ?1
             ORDER BY family ASC, qualifier ASC",
        )?;
        let cells = stmt
            .query_map([row], row_to_cell)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cells)
    }

    /// Delete the given `(family, qualifier)` cells of one row in a single
    /// transaction. Returns how many cells existed and were removed.
    pub fn delete_cells(&self, row: &str, columns: &[(String, String)]) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut deleted = 0u64;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM cells WHERE row_key = ?1 AND family = ?2 AND qualifier = ?3",
            )?;
            for (family, qualifier) in columns {
                deleted += stmt.execute(params![row, family, qualifier])? as u64;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Allocate the next value of a named, strictly increasing sequence. The
    /// first value handed out is 1.
    pub fn next_sequence(&self, name: &str) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = next_sequence_in(&tx, name)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn len(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM cells", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_to_cell(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cell> {
    Ok(Cell {
        row: row.get(0)?,
        family: row.get(1)?,
        qualifier: row.get(2)?,
        value: row.get(3)?,
    })
}

fn next_sequence_in(conn: &Connection, name: &str) -> Result<u64> {
    let current: Option<i64> = conn
        .query_row(
            "SELECT value FROM sequences WHERE name = ?1",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    let next = match current {
        Some(value) if value < 0 => {
            return Err(TableError::CorruptSequence {
                name: name.to_string(),
                value,
            })
        }
        Some(value) => value + 1,
        None => 1,
    };
    conn.execute(
        "INSERT INTO sequences(name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, next],
    )?;
    Ok(next as u64)
}
