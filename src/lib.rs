// ABOUTME: Replication progress tracking and garbage collection for a replicated sorted store
// ABOUTME: Exposes progress records, the record store contract, the collector, and the assigner

pub mod assigner;
#[cfg(feature = "sqlite-store")]
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gc;
pub mod progress;
pub mod report;
pub mod store;
pub mod target;
pub mod utils;

pub use assigner::{SequentialWorkAssigner, TargetState, TickReport};
pub use config::{ConfigProvider, FileConfigProvider, ReplicationConfig, StaticConfigProvider};
pub use daemon::{DaemonConfig, LedgerDaemon};
pub use error::{LedgerError, Result};
pub use gc::{GarbageCollector, GcStats};
pub use progress::{is_fully_replicated, ProgressRecord};
pub use store::{RecordGroup, RecordKey, RecordStore};
pub use target::ReplicationTarget;
