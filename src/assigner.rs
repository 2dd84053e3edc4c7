// ABOUTME: Sequential work assigner: one outstanding file per (table, target)
// ABOUTME: Creates Work records in file sealing order so peers receive mutations in order

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, Result};
use crate::gc::group_table;
use crate::progress::{is_fully_replicated, ProgressRecord};
use crate::store::{CreateOutcome, RecordGroup, RecordStore, StatusEntry};
use crate::target::ReplicationTarget;

/// Where a (table, target) pair stands after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    NoWorkAssigned,
    WorkInProgress { file: String },
    /// Every known file has been replicated; `file` is the latest one.
    Complete { file: String },
    /// Nothing after `file` may be assigned until its records decode again.
    Blocked { file: String },
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::NoWorkAssigned => write!(f, "idle"),
            TargetState::WorkInProgress { file } => write!(f, "replicating {}", file),
            TargetState::Complete { file } => write!(f, "caught up through {}", file),
            TargetState::Blocked { file } => write!(f, "held behind malformed {}", file),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick_at: DateTime<Utc>,
    pub tables: usize,
    /// Work records created this tick, as (target, file).
    pub work_created: Vec<(ReplicationTarget, String)>,
    pub in_flight: usize,
    pub states: BTreeMap<ReplicationTarget, TargetState>,
}

/// A file with a Status record, in sealing order.
struct Candidate {
    file: String,
    status: StatusEntry,
    work: BTreeMap<ReplicationTarget, ProgressRecord>,
    /// The file's Work records could not be read, so no target may pass it.
    blocked: bool,
}

impl Candidate {
    fn from_group(group: RecordGroup) -> Option<Self> {
        let status = group.status?;
        Some(Self {
            file: group.file,
            status,
            work: group.work,
            blocked: false,
        })
    }

    fn blocking(file: String, status: StatusEntry) -> Self {
        Self {
            file,
            status,
            work: BTreeMap::new(),
            blocked: true,
        }
    }

    /// Whether `target` must finish (or wait on) this file before any later one.
    fn holds(&self, target: &ReplicationTarget) -> bool {
        self.blocked
            || self
                .work
                .get(target)
                .map(|p| !is_fully_replicated(p))
                .unwrap_or(false)
    }

    fn order_key(&self) -> (u64, &str) {
        (self.status.sequence, self.file.as_str())
    }

    /// Initial Work record for a file that has not been assigned yet.
    fn seed(&self) -> ProgressRecord {
        let status = self.status.progress;
        ProgressRecord::new(0, status.end, status.closed, status.infinite_end)
    }
}

/// Scan result: candidates per replicated table, plus the first malformed file
/// that could not be attributed to any table.
struct Candidates {
    by_table: BTreeMap<String, Vec<Candidate>>,
    unplaced: Option<String>,
}

pub struct SequentialWorkAssigner<S: RecordStore> {
    store: Arc<S>,
    in_flight: Mutex<BTreeMap<ReplicationTarget, String>>,
}

impl<S: RecordStore> SequentialWorkAssigner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    /// File currently being replicated for each target, as of the last tick.
    pub fn in_flight(&self) -> BTreeMap<ReplicationTarget, String> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let tables: BTreeSet<String> = self.store.replicated_tables()?.into_iter().collect();
        let mut report = TickReport {
            tick_at: now,
            tables: tables.len(),
            work_created: Vec::new(),
            in_flight: 0,
            states: BTreeMap::new(),
        };
        let mut in_flight = BTreeMap::new();

        if !tables.is_empty() {
            let candidates = self.candidates_by_table(&tables)?;
            let hold = candidates.unplaced.as_deref();
            for table in &tables {
                let files = candidates
                    .by_table
                    .get(table)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                for target in self.store.list_configured_targets(table)? {
                    let state = self.advance(&target, files, hold, &mut report.work_created)?;
                    if let TargetState::WorkInProgress { file } = &state {
                        in_flight.insert(target.clone(), file.clone());
                    }
                    report.states.insert(target, state);
                }
            }
        }

        report.in_flight = in_flight.len();
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = in_flight;

        if !report.work_created.is_empty() {
            tracing::info!(
                "Assignment tick at {}: created {} work record(s), {} target(s) in flight",
                now.to_rfc3339(),
                report.work_created.len(),
                report.in_flight
            );
        } else {
            tracing::debug!(
                "Assignment tick at {}: nothing to assign, {} target(s) in flight",
                now.to_rfc3339(),
                report.in_flight
            );
        }
        Ok(report)
    }

    /// Files of the replicated tables that still have a Status record, sorted
    /// by (sequence, file).
    ///
    /// A malformed group whose Status record still decodes stays in line as a
    /// blocking candidate. One that cannot be placed at all holds back every
    /// table.
    fn candidates_by_table(&self, tables: &BTreeSet<String>) -> Result<Candidates> {
        let mut by_table: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        let mut unplaced: Option<String> = None;
        for item in self.store.scan_grouped_by_file()? {
            let group = match item {
                Ok(group) => group,
                Err(LedgerError::MalformedProgressRecord { file, reason }) => {
                    match self.store.status_record(&file) {
                        Ok(Some(status)) => {
                            tracing::warn!(
                                "Holding back table {} behind malformed record group {}: {}",
                                status.source_table_id,
                                file,
                                reason
                            );
                            if tables.contains(&status.source_table_id) {
                                by_table
                                    .entry(status.source_table_id.clone())
                                    .or_default()
                                    .push(Candidate::blocking(file, status));
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(
                                "Ignoring malformed record group {} without a Status record: {}",
                                file,
                                reason
                            );
                        }
                        Err(LedgerError::MalformedProgressRecord { .. }) => {
                            tracing::warn!(
                                "Holding back all assignment behind malformed record group {}: {}",
                                file,
                                reason
                            );
                            if unplaced.is_none() {
                                unplaced = Some(file);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(table) = group_table(&group).map(str::to_string) else {
                continue;
            };
            if !tables.contains(&table) {
                continue;
            }
            if let Some(candidate) = Candidate::from_group(group) {
                by_table.entry(table).or_default().push(candidate);
            }
        }
        for files in by_table.values_mut() {
            files.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        }
        Ok(Candidates { by_table, unplaced })
    }

    /// Move one target forward by at most one file. Nothing is created while
    /// `hold` names an unplaceable malformed file.
    fn advance(
        &self,
        target: &ReplicationTarget,
        files: &[Candidate],
        hold: Option<&str>,
        created: &mut Vec<(ReplicationTarget, String)>,
    ) -> Result<TargetState> {
        if let Some(current) = files.iter().find(|c| c.holds(target)) {
            let file = current.file.clone();
            return Ok(if current.blocked {
                TargetState::Blocked { file }
            } else {
                TargetState::WorkInProgress { file }
            });
        }

        let Some(next) = files.iter().find(|c| !c.work.contains_key(target)) else {
            return Ok(match files.last() {
                Some(last) => TargetState::Complete {
                    file: last.file.clone(),
                },
                None => TargetState::NoWorkAssigned,
            });
        };
        if let Some(file) = hold {
            return Ok(TargetState::Blocked {
                file: file.to_string(),
            });
        }

        match self
            .store
            .create_work_record_if_absent(&next.file, target, next.seed())?
        {
            CreateOutcome::Created => {
                tracing::debug!("Assigned {} to {}", next.file, target);
                created.push((target.clone(), next.file.clone()));
                Ok(TargetState::WorkInProgress {
                    file: next.file.clone(),
                })
            }
            CreateOutcome::AlreadyExists => {
                tracing::debug!(
                    "Work for {} toward {} was created concurrently",
                    next.file,
                    target
                );
                Ok(TargetState::WorkInProgress {
                    file: next.file.clone(),
                })
            }
            CreateOutcome::StatusMissing => {
                tracing::debug!("{} was removed before it could be assigned", next.file);
                Ok(TargetState::NoWorkAssigned)
            }
        }
    }
}
