//! Provides Graph (§4.D) — directed capability edges between modules.

use crate::error::{CoreError, Result};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PROVIDES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("provides_edges");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Workspace,
    Tool,
    Instruction,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Workspace => "workspace",
            ResourceKind::Tool => "tool",
            ResourceKind::Instruction => "instruction",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidesEdge {
    pub provider_id: String,
    pub receiver_id: String,
    pub resource_kind: ResourceKind,
    pub description: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn edge_key(provider: &str, receiver: &str, kind: ResourceKind) -> String {
    format!("{provider}|{receiver}|{}", kind.as_str())
}

pub struct ProvidesGraph {
    db: Arc<Database>,
}

impl ProvidesGraph {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PROVIDES_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Creates `(provider, receiver, kind)`. No self-loops. Idempotent:
    /// re-adding an existing edge refreshes `updated_at` rather than
    /// erroring (§4.D).
    pub fn create_edge(
        &self,
        provider_id: &str,
        receiver_id: &str,
        kind: ResourceKind,
        description: Option<String>,
    ) -> Result<ProvidesEdge> {
        if provider_id == receiver_id {
            return Err(CoreError::CompositionError(format!(
                "provides edge cannot be a self-loop ({provider_id})"
            )));
        }
        let write_txn = self.db.begin_write()?;
        let now = crate::util::now_ts_secs();
        let edge = {
            let mut table = write_txn.open_table(PROVIDES_TABLE)?;
            let key = edge_key(provider_id, receiver_id, kind);
            let created_at = match table.get(key.as_str())? {
                Some(existing) => {
                    let existing: ProvidesEdge = serde_json::from_str(existing.value())?;
                    existing.created_at
                }
                None => now,
            };
            let edge = ProvidesEdge {
                provider_id: provider_id.to_string(),
                receiver_id: receiver_id.to_string(),
                resource_kind: kind,
                description,
                created_at,
                updated_at: now,
            };
            table.insert(key.as_str(), serde_json::to_string(&edge)?.as_str())?;
            edge
        };
        write_txn.commit()?;
        Ok(edge)
    }

    pub fn delete_edge(&self, provider_id: &str, receiver_id: &str, kind: ResourceKind) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROVIDES_TABLE)?;
            let key = edge_key(provider_id, receiver_id, kind);
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_receivers_of_provider_kind(
        &self,
        provider_id: &str,
        kind: ResourceKind,
    ) -> Result<Vec<ProvidesEdge>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROVIDES_TABLE)?;
        let prefix = format!("{provider_id}|");
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let edge: ProvidesEdge = serde_json::from_str(value.value())?;
            if edge.resource_kind == kind {
                out.push(edge);
            }
        }
        Ok(out)
    }

    pub fn list_providers_to_receiver(
        &self,
        receiver_id: &str,
        kind: ResourceKind,
    ) -> Result<Vec<ProvidesEdge>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROVIDES_TABLE)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            let edge: ProvidesEdge = serde_json::from_str(value.value())?;
            if edge.receiver_id == receiver_id && edge.resource_kind == kind {
                out.push(edge);
            }
        }
        Ok(out)
    }

    /// Whether an edge `(provider, receiver, tool)` exists — the
    /// authorization check `execute_external_tool` performs before
    /// dispatch (§4.I, §8).
    pub fn has_edge(&self, provider_id: &str, receiver_id: &str, kind: ResourceKind) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROVIDES_TABLE)?;
        let key = edge_key(provider_id, receiver_id, kind);
        Ok(table.get(key.as_str())?.is_some())
    }

    /// Removes every edge where `module_id` is either endpoint, inside the
    /// caller's own write transaction — used by the Module Registry's
    /// `delete_module` so the cascade happens atomically with the module
    /// row deletion (§4.D "no cascade ... without explicit call by the
    /// Module Registry ... inside the same transaction").
    pub fn delete_edges_touching_in_txn(write_txn: &WriteTransaction, module_id: &str) -> Result<()> {
        let mut table = write_txn.open_table(PROVIDES_TABLE)?;
        let stale: Vec<String> = table
            .iter()?
            .filter_map(|row| row.ok())
            .filter_map(|(key, value)| {
                let edge: ProvidesEdge = serde_json::from_str(value.value()).ok()?;
                if edge.provider_id == module_id || edge.receiver_id == module_id {
                    Some(key.value().to_string())
                } else {
                    None
                }
            })
            .collect();
        for key in stale {
            table.remove(key.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_graph() -> ProvidesGraph {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(redb::Database::create(dir.path().join("test.redb")).unwrap());
        std::mem::forget(dir);
        ProvidesGraph::new(db).unwrap()
    }

    #[test]
    fn rejects_self_loops() {
        let graph = test_graph();
        let err = graph
            .create_edge("m1", "m1", ResourceKind::Tool, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::CompositionError(_)));
    }

    #[test]
    fn create_is_idempotent_and_refreshes_updated_at() {
        let graph = test_graph();
        let first = graph.create_edge("m1", "m2", ResourceKind::Tool, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = graph.create_edge("m1", "m2", ResourceKind::Tool, None).unwrap();
        assert_eq!(first.created_at, second.created_at);
        let receivers = graph.list_receivers_of_provider_kind("m1", ResourceKind::Tool).unwrap();
        assert_eq!(receivers.len(), 1);
    }

    #[test]
    fn revoke_then_capability_denied() {
        let graph = test_graph();
        graph.create_edge("m1", "m2", ResourceKind::Tool, None).unwrap();
        assert!(graph.has_edge("m1", "m2", ResourceKind::Tool).unwrap());
        graph.delete_edge("m1", "m2", ResourceKind::Tool).unwrap();
        assert!(!graph.has_edge("m1", "m2", ResourceKind::Tool).unwrap());
    }
}
