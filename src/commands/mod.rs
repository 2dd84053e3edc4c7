// ABOUTME: Command implementations for the replication-ledger CLI
// ABOUTME: Shared store/config resolution plus one module per command group

pub mod maintenance;
pub mod records;
pub mod status;
pub mod targets;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigProvider, FileConfigProvider, ReplicationConfig, StaticConfigProvider};
use crate::store::SqliteRecordStore;
use crate::utils;

/// Store and configuration locations shared by every command.
#[derive(Debug, Clone)]
pub struct LedgerPaths {
    pub store: PathBuf,
    pub config: PathBuf,
}

impl LedgerPaths {
    /// Resolve the CLI flags, falling back to ~/.replication-ledger/.
    pub fn resolve(store: Option<PathBuf>, config: Option<PathBuf>) -> Result<Self> {
        let store = match store {
            Some(path) => path,
            None => utils::default_store_path()?,
        };
        let config = match config {
            Some(path) => path,
            None => utils::default_config_path()?,
        };
        Ok(Self { store, config })
    }

    /// Load the configuration file once, or an empty configuration if it does
    /// not exist yet.
    pub fn load_config(&self) -> Result<ReplicationConfig> {
        if !self.config.exists() {
            return Ok(ReplicationConfig::default());
        }
        ReplicationConfig::load(&self.config)
            .with_context(|| format!("Failed to load configuration {}", self.config.display()))
    }

    /// Configuration provider that follows edits of the configuration file.
    pub fn config_provider(&self) -> Result<Arc<dyn ConfigProvider>> {
        if !self.config.exists() {
            tracing::warn!(
                "No configuration at {}; no table is replicated",
                self.config.display()
            );
            return Ok(Arc::new(StaticConfigProvider::default()));
        }
        let refresh = Duration::from_secs(self.load_config()?.daemon.refresh_secs);
        let provider = FileConfigProvider::new(&self.config, refresh);
        // Fail fast on a broken file instead of on the first pass
        provider
            .current()
            .with_context(|| format!("Invalid configuration {}", self.config.display()))?;
        Ok(Arc::new(provider))
    }

    pub fn open_store(&self) -> Result<Arc<SqliteRecordStore>> {
        let provider = self.config_provider()?;
        let store = SqliteRecordStore::open(&self.store, provider)
            .with_context(|| format!("Failed to open record store {}", self.store.display()))?;
        Ok(Arc::new(store))
    }
}
