// ABOUTME: Progress records for source files and per-target work
// ABOUTME: Includes the completion check and the merge rule used for in-place updates

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, Result};

/// How much of one file has been processed, either on the source side (the
/// Status record) or toward a single target (a Work record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Next unprocessed offset.
    pub begin: u64,
    /// Known end of valid data. Meaningless while `infinite_end` is set.
    pub end: u64,
    /// No more bytes will ever be appended to the file.
    pub closed: bool,
    /// The end is not known yet; the file is still being written.
    pub infinite_end: bool,
}

impl ProgressRecord {
    pub fn new(begin: u64, end: u64, closed: bool, infinite_end: bool) -> Self {
        Self {
            begin,
            end,
            closed,
            infinite_end,
        }
    }

    /// A freshly created file whose length is not known yet.
    pub fn open_with_unknown_length() -> Self {
        Self::new(0, 0, false, true)
    }

    /// An open file known to contain `end` bytes so far.
    pub fn ingested_until(end: u64) -> Self {
        Self::new(0, end, false, false)
    }

    /// A sealed file of `end` bytes, nothing processed yet.
    pub fn file_closed(end: u64) -> Self {
        Self::new(0, end, true, false)
    }

    /// Progress of a shipping worker that has sent everything before `begin`.
    pub fn replicated_until(begin: u64, end: u64) -> Self {
        Self::new(begin, end, false, false)
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    pub fn is_fully_replicated(&self) -> bool {
        is_fully_replicated(self)
    }

    /// Bytes still to process, or `None` while the end is unknown.
    pub fn remaining(&self) -> Option<u64> {
        if self.infinite_end {
            None
        } else {
            Some(self.end.saturating_sub(self.begin))
        }
    }

    /// Reject records whose offsets contradict each other.
    pub fn validate(&self, file: &str) -> Result<()> {
        if !self.infinite_end && self.begin > self.end {
            return Err(LedgerError::malformed(
                file,
                format!("begin {} exceeds end {}", self.begin, self.end),
            ));
        }
        Ok(())
    }

    /// Combine two observations of the same record. Offsets only move forward,
    /// a closed file stays closed, and a known end is never forgotten, so the
    /// result does not depend on the order updates arrive in.
    pub fn merge(self, other: ProgressRecord) -> ProgressRecord {
        ProgressRecord {
            begin: self.begin.max(other.begin),
            end: self.end.max(other.end),
            closed: self.closed || other.closed,
            infinite_end: self.infinite_end && other.infinite_end,
        }
    }
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = if self.infinite_end {
            "inf".to_string()
        } else {
            self.end.to_string()
        };
        write!(
            f,
            "[{}, {}) {}",
            self.begin,
            end,
            if self.closed { "closed" } else { "open" }
        )
    }
}

/// True iff the file is closed, its end is known, and every byte up to that
/// end has been processed.
pub fn is_fully_replicated(record: &ProgressRecord) -> bool {
    record.closed && !record.infinite_end && record.begin >= record.end
}
