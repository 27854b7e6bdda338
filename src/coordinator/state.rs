//! Coordinator state persisted across restarts.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GitPipelineResult;

/// Ledger entry for a task that reached the git pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub result: GitPipelineResult,
    /// Whether the result record reached `task.results`.
    pub forwarded: bool,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// Baseline digests plus the per-task pipeline ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub baseline: BTreeMap<String, String>,
    #[serde(default)]
    pub ledger: BTreeMap<String, LedgerEntry>,
}

impl PersistedState {
    /// Drops forwarded ledger entries recorded before `cutoff`. Entries not
    /// yet forwarded are kept so a redelivery can still finish them.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.ledger.len();
        self.ledger
            .retain(|_, entry| !entry.forwarded || entry.recorded_at >= cutoff);
        before - self.ledger.len()
    }

    /// Loads the state file, or `None` if it does not exist yet.
    pub async fn load(path: &Path) -> io::Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes the state atomically (temp file then rename).
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}
