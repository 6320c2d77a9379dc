//! Raw `kit.yaml` schema (§6) and its resolution into the in-memory [`Kit`]
//! shape consumed by the rest of the core.
//!
//! Grounded on `original_source/engine/services/core/kit.py`: the manifest's
//! `profiles{}` map resolves each profile's `instruction` path and each
//! action's `path: "file:function"` into absolute filesystem paths at parse
//! time, not lazily — `get_kit_config` (§4.C) hands out the resolved form.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SUPPORTED_DOC_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvironmentVar {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAgent {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawActionRef {
    /// `"file:function"`, relative to the kit's `actions/` tree.
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProfile {
    pub agent: String,
    /// Relative to the kit's `instructions/` tree.
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub actions: Vec<RawActionRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProvidedInstruction {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProvidedTool {
    pub name: String,
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawProvidedWorkspace {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawProvide {
    #[serde(default)]
    pub actions: Vec<RawActionRef>,
    #[serde(default)]
    pub instructions: Vec<RawProvidedInstruction>,
    #[serde(default)]
    pub tools: Vec<RawProvidedTool>,
    #[serde(default)]
    pub workspace: Option<RawProvidedWorkspace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWorkspaceFile {
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RawWorkspace {
    #[serde(default)]
    pub files: Vec<RawWorkspaceFile>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPort {
    pub port: u16,
    pub name: String,
}

/// Deserialized shape of `kit.yaml`, before path resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawManifest {
    #[serde(rename = "docVersion")]
    pub doc_version: String,
    pub id: String,
    pub owner: String,
    pub version: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: Vec<RawEnvironmentVar>,
    #[serde(default)]
    pub agents: Vec<RawAgent>,
    #[serde(default)]
    pub profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    pub provide: RawProvide,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub workspace: RawWorkspace,
    #[serde(default)]
    pub ports: Vec<RawPort>,
}

impl RawManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: RawManifest = serde_yaml::from_slice(bytes)
            .map_err(|e| CoreError::MalformedKit(format!("kit.yaml parse error: {e}")))?;
        if manifest.doc_version != SUPPORTED_DOC_VERSION {
            return Err(CoreError::MalformedKit(format!(
                "unsupported docVersion {:?}, expected {SUPPORTED_DOC_VERSION:?}",
                manifest.doc_version
            )));
        }
        if manifest.owner.trim().is_empty() {
            return Err(CoreError::MalformedKit("missing owner".into()));
        }
        if manifest.id.trim().is_empty() {
            return Err(CoreError::MalformedKit("missing id".into()));
        }
        if manifest.version.trim().is_empty() {
            return Err(CoreError::MalformedKit("missing version".into()));
        }
        crate::kit::version::validate(&manifest.version)?;
        Ok(manifest)
    }
}

/// A resolved action reference: `path` is absolute and the action's
/// callable lives at `function` inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub path: PathBuf,
    pub function: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub agent: String,
    pub instruction_path: Option<PathBuf>,
    pub actions: Vec<ResolvedAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedProvidedInstruction {
    pub path: PathBuf,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolvedProvide {
    pub actions: Vec<ResolvedAction>,
    pub instructions: Vec<ResolvedProvidedInstruction>,
    pub tools: Vec<RawProvidedTool>,
    pub workspace: Option<RawProvidedWorkspace>,
}

/// The fully-resolved, in-memory kit shape — §3 `Kit`. Immutable once
/// ingested; returned by `get_kit_config` (§4.C) with every path absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kit {
    pub owner: String,
    pub kit_id: String,
    pub semver: String,
    pub name: String,
    pub base_image: String,
    pub declared_env: Vec<RawEnvironmentVar>,
    pub agents: Vec<RawAgent>,
    pub profiles: BTreeMap<String, ResolvedProfile>,
    pub provides: ResolvedProvide,
    pub dependencies: Vec<String>,
    pub ports: Vec<RawPort>,
    pub workspace_seed_paths: Vec<String>,
    pub ignore_globs: Vec<String>,
    /// Absolute directory this kit's content (`actions/`, `instructions/`) was
    /// extracted into: `base_path/owner/kit_id/version/`.
    pub kit_dir: PathBuf,
}

fn split_action_path(raw: &str) -> Result<(String, String)> {
    let (file, func) = raw.split_once(':').ok_or_else(|| {
        CoreError::MalformedKit(format!("action path {raw:?} is not in \"file:function\" form"))
    })?;
    if file.trim().is_empty() || func.trim().is_empty() {
        return Err(CoreError::MalformedKit(format!(
            "action path {raw:?} is not in \"file:function\" form"
        )));
    }
    Ok((file.to_string(), func.to_string()))
}

fn resolve_action(kit_dir: &Path, raw: &RawActionRef) -> Result<ResolvedAction> {
    let (file, function) = split_action_path(&raw.path)?;
    let abs = kit_dir.join("actions").join(&file);
    if !abs.is_file() {
        return Err(CoreError::MalformedKit(format!(
            "action {:?} refers to missing file {abs:?}",
            raw.name
        )));
    }
    Ok(ResolvedAction {
        path: abs,
        function,
        name: raw.name.clone(),
        description: raw.description.clone(),
    })
}

impl Kit {
    /// Resolves a freshly-parsed `RawManifest` against the directory its
    /// archive was extracted into, checking every action path actually
    /// exists under `actions/` (§4.A "every action path ... resolves to a
    /// file in `actions/`").
    pub fn resolve(raw: RawManifest, kit_dir: PathBuf) -> Result<Kit> {
        let mut profiles = BTreeMap::new();
        for (profile_name, raw_profile) in &raw.profiles {
            let instruction_path = match &raw_profile.instruction {
                Some(rel) => {
                    let abs = kit_dir.join("instructions").join(rel);
                    if !abs.is_file() {
                        return Err(CoreError::MalformedKit(format!(
                            "profile {profile_name:?} instruction {abs:?} missing"
                        )));
                    }
                    Some(abs)
                }
                None => None,
            };
            let actions = raw_profile
                .actions
                .iter()
                .map(|a| resolve_action(&kit_dir, a))
                .collect::<Result<Vec<_>>>()?;
            profiles.insert(
                profile_name.clone(),
                ResolvedProfile {
                    agent: raw_profile.agent.clone(),
                    instruction_path,
                    actions,
                },
            );
        }

        let provide_actions = raw
            .provide
            .actions
            .iter()
            .map(|a| resolve_action(&kit_dir, a))
            .collect::<Result<Vec<_>>>()?;
        let provide_instructions = raw
            .provide
            .instructions
            .iter()
            .map(|i| -> Result<ResolvedProvidedInstruction> {
                let abs = kit_dir.join("instructions").join(&i.path);
                if !abs.is_file() {
                    return Err(CoreError::MalformedKit(format!(
                        "provided instruction {:?} refers to missing file {abs:?}",
                        i.name
                    )));
                }
                Ok(ResolvedProvidedInstruction {
                    path: abs,
                    name: i.name.clone(),
                    description: i.description.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let workspace_seed_paths = raw.workspace.files.iter().map(|f| f.path.clone()).collect();

        Ok(Kit {
            owner: raw.owner,
            kit_id: raw.id,
            semver: raw.version,
            name: raw.name,
            base_image: raw.image,
            declared_env: raw.environment,
            agents: raw.agents,
            profiles,
            provides: ResolvedProvide {
                actions: provide_actions,
                instructions: provide_instructions,
                tools: raw.provide.tools,
                workspace: raw.provide.workspace,
            },
            dependencies: raw.dependencies,
            ports: raw.ports,
            workspace_seed_paths,
            ignore_globs: raw.workspace.ignore,
            kit_dir,
        })
    }

    /// The agent class name bound to `profile`'s `agent` slot (§4.H step 3).
    pub fn class_for_profile(&self, profile: &str) -> Result<&str> {
        let profile = self
            .profiles
            .get(profile)
            .ok_or_else(|| CoreError::MalformedKit(format!("no such profile {profile:?}")))?;
        self.agents
            .iter()
            .find(|a| a.name == profile.agent)
            .map(|a| a.class.as_str())
            .ok_or_else(|| {
                CoreError::MalformedKit(format!(
                    "profile agent slot {:?} has no matching agents[] entry",
                    profile.agent
                ))
            })
    }
}
