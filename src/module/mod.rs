//! Module Registry (§4.C) — tenant records, project path labels, encrypted
//! environment variables, and the per-module `STANDBY`/`EXECUTING` flag.

use crate::error::{CoreError, Result};
use crate::kit::KitStore;
use crate::workspace_store::WorkspaceStore;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

const MODULES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("modules");
const PROJECT_MAPPINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("project_mappings");
const AGENT_STATE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("agent_state");

/// Persisted row shape. `env_vars_encrypted` is the AES-256-GCM ciphertext
/// produced by [`crate::crypto::encrypt_json`]; the public [`Module`] type
/// callers see carries the decrypted map instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModuleRow {
    module_id: String,
    name: String,
    owner: String,
    kit_id: String,
    version: String,
    created_at: u64,
    env_vars_encrypted: String,
    workspace_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub module_id: String,
    pub name: String,
    pub owner: String,
    pub kit_id: String,
    pub version: String,
    pub created_at: u64,
    pub env_vars: serde_json::Value,
    pub workspace_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMapping {
    pub project_id: String,
    pub module_id: String,
    pub path: String,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStateKind {
    Standby,
    Executing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub module_id: String,
    pub state: AgentStateKind,
    pub last_updated: u64,
}

fn path_label_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9]+(\.[A-Za-z0-9]+)*$").expect("valid regex"))
}

fn validate_path_label(path: &str) -> Result<()> {
    if path_label_re().is_match(path) {
        Ok(())
    } else {
        Err(CoreError::InvalidPath(format!(
            "project mapping path {path:?} must match ^[A-Za-z0-9]+(\\.[A-Za-z0-9]+)*$"
        )))
    }
}

fn project_mapping_key(project_id: &str, module_id: &str) -> String {
    format!("{project_id}|{module_id}")
}

pub struct ModuleRegistry {
    db: Arc<Database>,
    kit_store: Arc<KitStore>,
    workspace_store: Arc<WorkspaceStore>,
    encryption_key: [u8; 32],
    workspace_seeds_base: PathBuf,
}

impl ModuleRegistry {
    pub fn new(
        db: Arc<Database>,
        kit_store: Arc<KitStore>,
        workspace_store: Arc<WorkspaceStore>,
        encryption_key: [u8; 32],
        workspace_seeds_base: PathBuf,
    ) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MODULES_TABLE)?;
            let _ = write_txn.open_table(PROJECT_MAPPINGS_TABLE)?;
            let _ = write_txn.open_table(AGENT_STATE_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self {
            db,
            kit_store,
            workspace_store,
            encryption_key,
            workspace_seeds_base,
        })
    }

    /// §4.C: assigns a fresh readable uid, materializes the workspace from
    /// the kit's seed, writes the Module + ProjectMapping rows in one
    /// transaction, initializes state to `STANDBY`, and rolls the
    /// workspace back on any later failure.
    pub fn create_module(
        &self,
        project_id: &str,
        owner: &str,
        kit_id: &str,
        version: &str,
        env_vars: serde_json::Value,
        path: &str,
        name: Option<String>,
    ) -> Result<Module> {
        validate_path_label(path)?;
        let kit = self.kit_store.get(owner, kit_id, version)?;

        let module_id = crate::util::generate_readable_uid("mod");
        let workspace_name = module_id.clone();

        let seed_bytes = self.snapshot_and_zip_seed(&kit)?;
        self.workspace_store.create(&workspace_name, &seed_bytes, |bytes, dest| {
            crate::kit::archive::extract_into_existing_dir(bytes, dest)
        })?;

        let result = self.write_module_rows(
            &module_id,
            name.unwrap_or_else(|| kit.name.clone()),
            owner,
            kit_id,
            version,
            &env_vars,
            &workspace_name,
            project_id,
            path,
        );

        match result {
            Ok(module) => Ok(module),
            Err(e) => {
                let _ = self.workspace_store.delete(&workspace_name);
                Err(e)
            }
        }
    }

    fn snapshot_and_zip_seed(&self, kit: &crate::kit::Kit) -> Result<Vec<u8>> {
        let ignore = build_ignore_set(&kit.ignore_globs)?;
        let seed_snapshot_dir = self
            .workspace_seeds_base
            .join(&kit.owner)
            .join(&kit.kit_id)
            .join(&kit.semver)
            .join("workspace");

        let source_root = kit.kit_dir.join("workspace");
        if !seed_snapshot_dir.exists() {
            for rel in &kit.workspace_seed_paths {
                if ignore.is_match(rel) {
                    continue;
                }
                let src = source_root.join(rel);
                if !src.is_file() {
                    continue;
                }
                let dst = seed_snapshot_dir.join(rel);
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| CoreError::DbError(e.to_string()))?;
                }
                std::fs::copy(&src, &dst).map_err(|e| CoreError::DbError(e.to_string()))?;
            }
        }

        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
            for rel in &kit.workspace_seed_paths {
                if ignore.is_match(rel) {
                    continue;
                }
                let src = seed_snapshot_dir.join(rel);
                if !src.is_file() {
                    continue;
                }
                let content = std::fs::read(&src).map_err(|e| CoreError::DbError(e.to_string()))?;
                writer
                    .start_file(rel.replace('\\', "/"), options)
                    .map_err(|e| CoreError::DbError(e.to_string()))?;
                std::io::Write::write_all(&mut writer, &content)
                    .map_err(|e| CoreError::DbError(e.to_string()))?;
            }
            writer.finish().map_err(|e| CoreError::DbError(e.to_string()))?;
        }
        Ok(buf)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_module_rows(
        &self,
        module_id: &str,
        name: String,
        owner: &str,
        kit_id: &str,
        version: &str,
        env_vars: &serde_json::Value,
        workspace_name: &str,
        project_id: &str,
        path: &str,
    ) -> Result<Module> {
        let now = crate::util::now_ts_secs();
        let encrypted = crate::crypto::encrypt_json(env_vars, &self.encryption_key)?;

        let row = ModuleRow {
            module_id: module_id.to_string(),
            name,
            owner: owner.to_string(),
            kit_id: kit_id.to_string(),
            version: version.to_string(),
            created_at: now,
            env_vars_encrypted: encrypted,
            workspace_name: workspace_name.to_string(),
        };
        let mapping = ProjectMapping {
            project_id: project_id.to_string(),
            module_id: module_id.to_string(),
            path: path.to_string(),
            created_at: now,
            updated_at: now,
        };
        let state = AgentState {
            module_id: module_id.to_string(),
            state: AgentStateKind::Standby,
            last_updated: now,
        };

        let write_txn = self.db.begin_write()?;
        {
            let mut modules = write_txn.open_table(MODULES_TABLE)?;
            modules.insert(module_id, serde_json::to_string(&row)?.as_str())?;

            let mut mappings = write_txn.open_table(PROJECT_MAPPINGS_TABLE)?;
            let key = project_mapping_key(project_id, module_id);
            mappings.insert(key.as_str(), serde_json::to_string(&mapping)?.as_str())?;

            let mut states = write_txn.open_table(AGENT_STATE_TABLE)?;
            states.insert(module_id, serde_json::to_string(&state)?.as_str())?;
        }
        write_txn.commit()?;

        Ok(Module {
            module_id: module_id.to_string(),
            name: row.name,
            owner: row.owner,
            kit_id: row.kit_id,
            version: row.version,
            created_at: row.created_at,
            env_vars: env_vars.clone(),
            workspace_name: row.workspace_name,
        })
    }

    pub fn get(&self, module_id: &str) -> Result<Module> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MODULES_TABLE)?;
        let value = table
            .get(module_id)?
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        let row: ModuleRow = serde_json::from_str(value.value())?;
        let env_vars = crate::crypto::decrypt_json(&row.env_vars_encrypted, &self.encryption_key)?;
        Ok(Module {
            module_id: row.module_id,
            name: row.name,
            owner: row.owner,
            kit_id: row.kit_id,
            version: row.version,
            created_at: row.created_at,
            env_vars,
            workspace_name: row.workspace_name,
        })
    }

    fn update_row<F>(&self, module_id: &str, mutate: F) -> Result<Module>
    where
        F: FnOnce(&mut ModuleRow),
    {
        let write_txn = self.db.begin_write()?;
        let row = {
            let mut table = write_txn.open_table(MODULES_TABLE)?;
            let mut row: ModuleRow = {
                let value = table
                    .get(module_id)?
                    .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
                serde_json::from_str(value.value())?
            };
            mutate(&mut row);
            table.insert(module_id, serde_json::to_string(&row)?.as_str())?;
            row
        };
        write_txn.commit()?;
        let env_vars = crate::crypto::decrypt_json(&row.env_vars_encrypted, &self.encryption_key)?;
        Ok(Module {
            module_id: row.module_id,
            name: row.name,
            owner: row.owner,
            kit_id: row.kit_id,
            version: row.version,
            created_at: row.created_at,
            env_vars,
            workspace_name: row.workspace_name,
        })
    }

    pub fn update_name(&self, module_id: &str, name: String) -> Result<Module> {
        self.update_row(module_id, |row| row.name = name)
    }

    pub fn update_env_var(&self, module_id: &str, key: &str, value: serde_json::Value) -> Result<Module> {
        let write_txn = self.db.begin_write()?;
        let row = {
            let mut table = write_txn.open_table(MODULES_TABLE)?;
            let mut row: ModuleRow = {
                let existing = table
                    .get(module_id)?
                    .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
                serde_json::from_str(existing.value())?
            };
            let mut env_vars = crate::crypto::decrypt_json(&row.env_vars_encrypted, &self.encryption_key)?;
            if let serde_json::Value::Object(ref mut map) = env_vars {
                map.insert(key.to_string(), value);
            } else {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), value);
                env_vars = serde_json::Value::Object(map);
            }
            row.env_vars_encrypted = crate::crypto::encrypt_json(&env_vars, &self.encryption_key)?;
            table.insert(module_id, serde_json::to_string(&row)?.as_str())?;
            row
        };
        write_txn.commit()?;
        let env_vars = crate::crypto::decrypt_json(&row.env_vars_encrypted, &self.encryption_key)?;
        Ok(Module {
            module_id: row.module_id,
            name: row.name,
            owner: row.owner,
            kit_id: row.kit_id,
            version: row.version,
            created_at: row.created_at,
            env_vars,
            workspace_name: row.workspace_name,
        })
    }

    /// Updates the project-path label for `(project_id, module_id)`.
    pub fn update_path(&self, project_id: &str, module_id: &str, path: &str) -> Result<ProjectMapping> {
        validate_path_label(path)?;
        let write_txn = self.db.begin_write()?;
        let mapping = {
            let mut table = write_txn.open_table(PROJECT_MAPPINGS_TABLE)?;
            let key = project_mapping_key(project_id, module_id);
            let mut mapping: ProjectMapping = {
                let existing = table.get(key.as_str())?.ok_or_else(|| {
                    CoreError::ModuleNotFound(format!("{project_id}/{module_id}"))
                })?;
                serde_json::from_str(existing.value())?
            };
            mapping.path = path.to_string();
            mapping.updated_at = crate::util::now_ts_secs();
            table.insert(key.as_str(), serde_json::to_string(&mapping)?.as_str())?;
            mapping
        };
        write_txn.commit()?;
        Ok(mapping)
    }

    /// Deletes the Module row, every ProjectMapping referencing it, its
    /// `AgentState`, every Provides edge touching it (cascaded inside this
    /// same transaction per §4.D), and finally the workspace on disk.
    pub fn delete_module(&self, module_id: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        let workspace_name = {
            let mut modules = write_txn.open_table(MODULES_TABLE)?;
            let row: ModuleRow = {
                let value = modules
                    .get(module_id)?
                    .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
                serde_json::from_str(value.value())?
            };
            modules.remove(module_id)?;
            row.workspace_name
        };
        {
            let mut mappings = write_txn.open_table(PROJECT_MAPPINGS_TABLE)?;
            let stale: Vec<String> = mappings
                .iter()?
                .filter_map(|row| row.ok())
                .filter_map(|(key, value)| {
                    let mapping: ProjectMapping = serde_json::from_str(value.value()).ok()?;
                    if mapping.module_id == module_id {
                        Some(key.value().to_string())
                    } else {
                        None
                    }
                })
                .collect();
            for key in stale {
                mappings.remove(key.as_str())?;
            }
        }
        {
            let mut states = write_txn.open_table(AGENT_STATE_TABLE)?;
            states.remove(module_id)?;
        }
        crate::provides::ProvidesGraph::delete_edges_touching_in_txn(&write_txn, module_id)?;
        write_txn.commit()?;

        self.workspace_store.delete(&workspace_name)
    }

    pub fn set_agent_state(&self, module_id: &str, state: AgentStateKind) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AGENT_STATE_TABLE)?;
            let record = AgentState {
                module_id: module_id.to_string(),
                state,
                last_updated: crate::util::now_ts_secs(),
            };
            table.insert(module_id, serde_json::to_string(&record)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_agent_state(&self, module_id: &str) -> Result<AgentState> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AGENT_STATE_TABLE)?;
        let value = table
            .get(module_id)?
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        Ok(serde_json::from_str(value.value())?)
    }

    /// §4.C: the resolved kit manifest for a module's `(owner, kit_id,
    /// version)`, with every action/instruction path already absolute.
    /// Never cached across requests — callers fetch fresh each time.
    pub fn get_kit_config(&self, module_id: &str) -> Result<crate::kit::Kit> {
        let module = self.get(module_id)?;
        self.kit_store.get(&module.owner, &module.kit_id, &module.version)
    }
}

fn build_ignore_set(globs: &[String]) -> Result<globset::GlobSet> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in globs {
        let glob = globset::Glob::new(pattern)
            .map_err(|e| CoreError::MalformedKit(format!("invalid ignore glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| CoreError::MalformedKit(format!("invalid ignore glob set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_label_boundary_cases() {
        assert!(validate_path_label("a").is_ok());
        assert!(validate_path_label("a.b").is_ok());
        assert!(validate_path_label("a.b.c.1").is_ok());
        assert!(validate_path_label("a..b").is_err());
        assert!(validate_path_label(".a").is_err());
        assert!(validate_path_label("a.").is_err());
        assert!(validate_path_label("a b").is_err());
    }
}
