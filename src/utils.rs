// ABOUTME: Utility functions for retries and default file locations
// ABOUTME: Shared by the command layer and the daemon entry point

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Retry a ledger operation with exponential backoff
///
/// Only errors for which [`crate::LedgerError::is_retryable`] holds are retried;
/// anything else is returned immediately. Each retry doubles the delay.
///
/// # Arguments
///
/// * `operation` - Async function to retry
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}; retrying in {:?}...",
                    attempt,
                    max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2; // Exponential backoff
            }
            Err(e) => return Err(e),
        }
    }
}

/// Directory holding the default store and configuration.
/// Returns ~/.replication-ledger/
pub fn ledger_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".replication-ledger"))
}

pub fn default_store_path() -> anyhow::Result<PathBuf> {
    Ok(ledger_dir()?.join("ledger.db"))
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(ledger_dir()?.join("replication.toml"))
}
