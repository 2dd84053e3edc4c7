// ABOUTME: Error kinds surfaced by the replication ledger
// ABOUTME: Every variant is recoverable by retrying on the next pass or tick

use std::time::Duration;

use thiserror::Error;

use crate::target::ReplicationTarget;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The record store could not be read from or written to.
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    /// A record failed basic invariant checks. The containing group is skipped.
    #[error("malformed progress record for {file}: {reason}")]
    MalformedProgressRecord { file: String, reason: String },

    /// Some deletions of a pass failed. `removed` records were deleted anyway.
    #[error("{} file group(s) could not be fully deleted ({removed} records removed)", failed_files.len())]
    PartialBatchDeleteFailure {
        removed: u64,
        failed_files: Vec<String>,
    },

    /// Work records are only created by the assigner; updates require one.
    #[error("no work record for {file} toward {target}")]
    MissingWorkRecord {
        file: String,
        target: ReplicationTarget,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("table {table} still had {pending} pending file(s) after {waited:?}")]
    DrainTimeout {
        table: String,
        pending: usize,
        waited: Duration,
    },
}

impl LedgerError {
    pub fn malformed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedProgressRecord {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Whether the next scheduled pass can be expected to make progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::StoreUnavailable(_)
            | LedgerError::PartialBatchDeleteFailure { .. }
            | LedgerError::DrainTimeout { .. } => true,
            LedgerError::MalformedProgressRecord { .. }
            | LedgerError::MissingWorkRecord { .. }
            | LedgerError::Config(_) => false,
        }
    }
}

#[cfg(feature = "sqlite-store")]
impl From<ledger_table::TableError> for LedgerError {
    fn from(err: ledger_table::TableError) -> Self {
        LedgerError::StoreUnavailable(err.to_string())
    }
}
