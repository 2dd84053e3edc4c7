// ABOUTME: Replication configuration: which tables replicate to which peers
// ABOUTME: Loaded from TOML and served through an explicitly injected, cached provider

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{LedgerError, Result};
use crate::target::ReplicationTarget;

/// Intervals for the periodic control loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub gc_interval_secs: u64,
    pub assign_interval_secs: u64,
    /// How long a loaded configuration is trusted before it is re-read.
    pub refresh_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            gc_interval_secs: 30,
            assign_interval_secs: 5,
            refresh_secs: 60,
        }
    }
}

/// Replication settings of a single source table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableReplication {
    pub enabled: bool,
    /// Peer name to remote table id.
    pub targets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub daemon: DaemonSettings,
    /// Keyed by source table id.
    pub tables: BTreeMap<String, TableReplication>,
}

impl ReplicationConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ReplicationConfig =
            toml::from_str(contents).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.daemon.gc_interval_secs == 0 || self.daemon.assign_interval_secs == 0 {
            return Err(LedgerError::Config(
                "daemon intervals must be at least one second".to_string(),
            ));
        }
        for (table, replication) in &self.tables {
            if table.is_empty() {
                return Err(LedgerError::Config("empty source table id".to_string()));
            }
            for (peer, remote) in &replication.targets {
                if peer.is_empty() || remote.is_empty() {
                    return Err(LedgerError::Config(format!(
                        "table {} has a target with an empty peer name or remote table id",
                        table
                    )));
                }
            }
        }
        Ok(())
    }

    /// Enable replication of `table` to `peer` (creating the table entry).
    pub fn add_target(&mut self, table: &str, peer: &str, remote_table_id: &str) {
        let entry = self.tables.entry(table.to_string()).or_default();
        entry.enabled = true;
        entry
            .targets
            .insert(peer.to_string(), remote_table_id.to_string());
    }

    /// Targets currently configured for `table`. Empty when replication is
    /// disabled or the table is unknown.
    pub fn targets_for(&self, table: &str) -> BTreeSet<ReplicationTarget> {
        match self.tables.get(table) {
            Some(replication) if replication.enabled => replication
                .targets
                .iter()
                .map(|(peer, remote)| ReplicationTarget::new(peer, remote, table))
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Tables with replication enabled and at least one target.
    pub fn replicated_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, r)| r.enabled && !r.targets.is_empty())
            .map(|(table, _)| table.clone())
            .collect()
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.gc_interval_secs)
    }

    pub fn assign_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.assign_interval_secs)
    }
}

/// Source of the current replication configuration. Implementations own their
/// cache lifetime; callers always ask for [`ConfigProvider::current`].
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Result<Arc<ReplicationConfig>>;

    /// Drop any cached configuration so the next call re-reads it.
    fn invalidate_cache(&self) {}
}

/// A configuration fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    config: Arc<ReplicationConfig>,
}

impl StaticConfigProvider {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn current(&self) -> Result<Arc<ReplicationConfig>> {
        Ok(self.config.clone())
    }
}

struct CachedConfig {
    loaded_at: Instant,
    config: Arc<ReplicationConfig>,
    stale: bool,
}

/// Reads the TOML file at `path`, trusting the result for `refresh`.
///
/// When a reload fails the last good configuration keeps being served, so an
/// operator typo does not make every table look unconfigured.
pub struct FileConfigProvider {
    path: PathBuf,
    refresh: Duration,
    cache: Mutex<Option<CachedConfig>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            path: path.into(),
            refresh,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn current(&self) -> Result<Arc<ReplicationConfig>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_ref() {
            if !cached.stale && cached.loaded_at.elapsed() < self.refresh {
                return Ok(cached.config.clone());
            }
        }

        match ReplicationConfig::load(&self.path) {
            Ok(config) => {
                let config = Arc::new(config);
                if cache.as_ref().map(|c| c.config != config).unwrap_or(true) {
                    tracing::info!(
                        path = %self.path.display(),
                        tables = config.replicated_tables().len(),
                        "loaded replication configuration"
                    );
                }
                *cache = Some(CachedConfig {
                    loaded_at: Instant::now(),
                    config: config.clone(),
                    stale: false,
                });
                Ok(config)
            }
            Err(e) => match cache.as_mut() {
                Some(cached) => {
                    tracing::error!(
                        path = %self.path.display(),
                        "Using previous replication configuration: {}",
                        e
                    );
                    cached.loaded_at = Instant::now();
                    cached.stale = false;
                    Ok(cached.config.clone())
                }
                None => Err(e),
            },
        }
    }

    fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_mut() {
            // Keep the value as a fallback but force a re-read
            cached.stale = true;
        }
    }
}
