use crate::prelude::*;
use crate::storage::GraphStorage;
use crate::types::{ChangeRecord, GraphEdge, GraphNode, Group};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Full dump of the four logical tables. Importing a snapshot restores
/// nodes and edges byte-for-byte, including graph-internal timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.edges.is_empty()
            && self.changes.is_empty()
            && self.groups.is_empty()
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }
}

/// Copies the full contents of `source` into `destination`. Works across
/// backend kinds; the destination should be empty or disposable.
pub async fn transfer(
    source: &dyn GraphStorage,
    destination: &dyn GraphStorage,
) -> Result<()> {
    let snapshot = source.export_snapshot().await?;
    info!(
        "transferring snapshot: {} nodes, {} edges, {} changes, {} groups",
        snapshot.nodes.len(),
        snapshot.edges.len(),
        snapshot.changes.len(),
        snapshot.groups.len()
    );
    destination.import_snapshot(&snapshot).await
}
