// ABOUTME: LedgerDaemon runs garbage collection and work assignment on fixed intervals
// ABOUTME: Each pass is independent; failures are logged and retried on the next interval

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::assigner::{SequentialWorkAssigner, TickReport};
use crate::config::DaemonSettings;
use crate::error::{LedgerError, Result};
use crate::gc::{GarbageCollector, GcStats};
use crate::store::RecordStore;

/// Configuration for the LedgerDaemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Interval between garbage collection passes
    pub gc_interval: Duration,
    /// Interval between assignment ticks
    pub assign_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from(&DaemonSettings::default())
    }
}

impl From<&DaemonSettings> for DaemonConfig {
    fn from(settings: &DaemonSettings) -> Self {
        Self {
            gc_interval: Duration::from_secs(settings.gc_interval_secs),
            assign_interval: Duration::from_secs(settings.assign_interval_secs),
        }
    }
}

/// Counters across the lifetime of a daemon run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub gc_passes: u64,
    pub gc_failures: u64,
    pub records_removed: u64,
    pub ticks: u64,
    pub tick_failures: u64,
    pub work_created: u64,
}

pub struct LedgerDaemon<S: RecordStore> {
    config: DaemonConfig,
    collector: GarbageCollector<S>,
    assigner: SequentialWorkAssigner<S>,
}

impl<S: RecordStore> LedgerDaemon<S> {
    pub fn new(store: Arc<S>, config: DaemonConfig) -> Self {
        Self {
            config,
            collector: GarbageCollector::new(store.clone()),
            assigner: SequentialWorkAssigner::new(store),
        }
    }

    pub fn assigner(&self) -> &SequentialWorkAssigner<S> {
        &self.assigner
    }

    /// One synchronous garbage collection pass.
    pub fn run_gc_pass(&self) -> Result<GcStats> {
        self.collector.run_pass()
    }

    /// One synchronous assignment tick.
    pub fn run_assignment_tick(&self, now: chrono::DateTime<Utc>) -> Result<TickReport> {
        self.assigner.tick(now)
    }

    /// Run both loops until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<DaemonStats> {
        let mut gc_interval = interval(self.config.gc_interval);
        let mut assign_interval = interval(self.config.assign_interval);
        gc_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        assign_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = DaemonStats::default();

        tracing::info!(
            "Starting LedgerDaemon with gc_interval={:?}, assign_interval={:?}",
            self.config.gc_interval,
            self.config.assign_interval
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping LedgerDaemon");
                    break;
                }
                _ = assign_interval.tick() => {
                    stats.ticks += 1;
                    match self.run_assignment_tick(Utc::now()) {
                        Ok(report) => stats.work_created += report.work_created.len() as u64,
                        Err(e) => {
                            stats.tick_failures += 1;
                            tracing::error!("Assignment tick {} failed: {}", stats.ticks, e);
                        }
                    }
                }
                _ = gc_interval.tick() => {
                    stats.gc_passes += 1;
                    match self.run_gc_pass() {
                        Ok(pass) => stats.records_removed += pass.records_removed,
                        Err(e) => {
                            stats.gc_failures += 1;
                            if let LedgerError::PartialBatchDeleteFailure { removed, .. } = &e {
                                stats.records_removed += *removed;
                            }
                            tracing::error!(
                                "Garbage collection pass {} failed: {}",
                                stats.gc_passes,
                                e
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(
            "LedgerDaemon stopped after {} pass(es) and {} tick(s): {} record(s) removed, {} work record(s) created",
            stats.gc_passes,
            stats.ticks,
            stats.records_removed,
            stats.work_created
        );
        Ok(stats)
    }
}
