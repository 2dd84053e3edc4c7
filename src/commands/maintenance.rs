// ABOUTME: Maintenance commands: one garbage collection pass, one assignment tick,
// ABOUTME: or both loops as a foreground daemon until Ctrl-C

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use std::time::Duration;
use tokio::sync::broadcast;

use super::LedgerPaths;
use crate::daemon::{DaemonConfig, LedgerDaemon};
use crate::utils::retry_with_backoff;

#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Retries after a transient store failure
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
    /// Delay before the first retry, in milliseconds (doubles each retry)
    #[arg(long = "retry-delay-ms", default_value_t = 500)]
    pub retry_delay_ms: u64,
}

impl RetryArgs {
    fn delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

pub async fn gc(paths: &LedgerPaths, retry: RetryArgs) -> Result<()> {
    let store = paths.open_store()?;
    let daemon = &LedgerDaemon::new(store, DaemonConfig::default());
    let stats = retry_with_backoff(
        || async move { daemon.run_gc_pass() },
        retry.retries,
        retry.delay(),
    )
    .await
    .context("Garbage collection pass failed")?;
    println!(
        "Removed {} record(s) across {} file(s); {} file(s) scanned, {} malformed",
        stats.records_removed, stats.groups_removed, stats.groups_scanned, stats.malformed_groups
    );
    Ok(())
}

pub async fn assign(paths: &LedgerPaths, retry: RetryArgs) -> Result<()> {
    let store = paths.open_store()?;
    let daemon = &LedgerDaemon::new(store, DaemonConfig::default());
    let report = retry_with_backoff(
        || async move { daemon.run_assignment_tick(Utc::now()) },
        retry.retries,
        retry.delay(),
    )
    .await
    .context("Assignment tick failed")?;

    for (target, file) in &report.work_created {
        println!("assigned {} -> {}", file, target);
    }
    for (target, state) in &report.states {
        println!("{}: {}", target, state);
    }
    if report.states.is_empty() {
        println!("No replicated tables configured.");
    }
    Ok(())
}

pub async fn run(paths: &LedgerPaths) -> Result<()> {
    let config = paths.load_config()?;
    let store = paths.open_store()?;
    let daemon = LedgerDaemon::new(store, DaemonConfig::from(&config.daemon));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down...");
            let _ = shutdown_tx.send(());
        }
    });

    let stats = daemon
        .run(shutdown_rx)
        .await
        .context("Daemon stopped with an error")?;
    println!(
        "Stopped: {} record(s) removed, {} work record(s) created ({} failed pass(es), {} failed tick(s))",
        stats.records_removed, stats.work_created, stats.gc_failures, stats.tick_failures
    );
    Ok(())
}
