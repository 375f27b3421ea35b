//! History snapshot persistence.
//!
//! Saves the node map and age counter as a versioned JSON document so
//! placement decisions survive a master restart. Live assignment state is
//! deliberately not persisted: running containers are re-reported after a
//! restart. Writes go to a temp file in the target directory and are renamed
//! into place, so a crash mid-save leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::history::RoleHistory;
use crate::node_map::{NodeMap, RoleUse};

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors from snapshot save/load.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("unsupported snapshot version {found} (expected {SNAPSHOT_VERSION})")]
    UnsupportedVersion { found: u32 },
}

/// One persisted (host, role priority) usage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SavedUse {
    host: String,
    priority: u32,
    #[serde(flatten)]
    usage: RoleUse,
}

/// On-disk history document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    version: u32,

    /// Logical clock at save time; restored so new stamps keep ordering.
    age: u64,

    /// Wall-clock save time, for operators only. Ordering never depends
    /// on it.
    saved_at: DateTime<Utc>,

    entries: Vec<SavedUse>,
}

impl HistorySnapshot {
    /// Capture the persistent portion of a history.
    pub fn capture(history: &RoleHistory) -> Self {
        let entries = history
            .node_map()
            .iter()
            .map(|(host, priority, usage)| SavedUse {
                host: host.to_string(),
                priority,
                usage: *usage,
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            age: history.age(),
            saved_at: Utc::now(),
            entries,
        }
    }

    /// Rebuild a history from this snapshot.
    pub fn restore(self, anti_affinity_limit: u32) -> Result<RoleHistory, HistoryError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(HistoryError::UnsupportedVersion {
                found: self.version,
            });
        }

        let mut node_map = NodeMap::new();
        for entry in self.entries {
            *node_map.entry(&entry.host, entry.priority) = RoleUse {
                live: 0,
                ..entry.usage
            };
        }

        Ok(RoleHistory::from_parts(node_map, self.age, anti_affinity_limit))
    }
}

/// Save a history snapshot atomically.
pub fn save_history(history: &RoleHistory, path: &Path) -> Result<(), HistoryError> {
    let snapshot = HistorySnapshot::capture(history);
    let json = serde_json::to_vec_pretty(&snapshot)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    info!(
        path = %path.display(),
        hosts = history.node_map().len(),
        age = history.age(),
        "Saved placement history"
    );
    Ok(())
}

/// Load a history snapshot, or start fresh if none exists yet.
pub fn load_history(path: &Path, anti_affinity_limit: u32) -> Result<RoleHistory, HistoryError> {
    if !path.exists() {
        info!(path = %path.display(), "No placement history found, starting fresh");
        return Ok(RoleHistory::new(anti_affinity_limit));
    }

    let bytes = fs::read(path)?;
    let snapshot: HistorySnapshot = serde_json::from_slice(&bytes)?;
    let history = snapshot.restore(anti_affinity_limit)?;

    info!(
        path = %path.display(),
        hosts = history.node_map().len(),
        "Loaded placement history"
    );
    Ok(history)
}
