// ABOUTME: Replication target identifier (peer, remote table, source table)
// ABOUTME: Value-equal map key with a stable serialized form for storage qualifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// One destination for one source table. Equality and hashing are structural.
/// The derived ordering exists only so iteration over targets is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub peer_name: String,
    pub remote_table_id: String,
    pub source_table_id: String,
}

impl ReplicationTarget {
    pub fn new(
        peer_name: impl Into<String>,
        remote_table_id: impl Into<String>,
        source_table_id: impl Into<String>,
    ) -> Self {
        Self {
            peer_name: peer_name.into(),
            remote_table_id: remote_table_id.into(),
            source_table_id: source_table_id.into(),
        }
    }

    /// Serialized form used as a column qualifier by persistent stores.
    pub fn to_qualifier(&self) -> String {
        serde_json::json!([self.peer_name, self.remote_table_id, self.source_table_id]).to_string()
    }

    pub fn from_qualifier(qualifier: &str) -> Result<Self, serde_json::Error> {
        let (peer_name, remote_table_id, source_table_id): (String, String, String) =
            serde_json::from_str(qualifier)?;
        Ok(Self {
            peer_name,
            remote_table_id,
            source_table_id,
        })
    }
}

impl fmt::Display for ReplicationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}<-{}",
            self.peer_name, self.remote_table_id, self.source_table_id
        )
    }
}
