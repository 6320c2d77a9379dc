//! Profile Composer (§4.J) — merges a profile's intrinsic actions with
//! tools/instructions provided by upstream modules, enforcing the Provides
//! Graph as the capability boundary.
//!
//! Directly generalizes the teacher's `engine::tool_registry::ToolRegistry`
//! (merge builtin + dynamically registered tool schemas, name-collision
//! detection) from a single-project scope to the module/provides-graph
//! scope described in §4.J.

use crate::error::{CoreError, Result};
use crate::kit::manifest::ResolvedAction;
use crate::module::ModuleRegistry;
use crate::parser::{self, ToolDescriptor};
use crate::provides::{ProvidesGraph, ResourceKind};
use std::collections::HashSet;
use std::path::Path;

/// One entry in a composed tool catalog: the descriptor plus where it
/// came from, so `get_provided_tools_schema` (§4.I) and
/// `execute_external_tool`'s routing can tell intrinsic and provided
/// tools apart without re-deriving it from the name.
#[derive(Debug, Clone)]
pub struct ComposedTool {
    pub descriptor: ToolDescriptor,
    pub provider_id: Option<String>,
}

pub struct ProfileComposer<'a> {
    modules: &'a ModuleRegistry,
    provides: &'a ProvidesGraph,
}

impl<'a> ProfileComposer<'a> {
    pub fn new(modules: &'a ModuleRegistry, provides: &'a ProvidesGraph) -> Self {
        Self { modules, provides }
    }

    fn parse_action(kit: &crate::kit::Kit, action: &ResolvedAction) -> Result<ToolDescriptor> {
        let actions_dir = kit.kit_dir.join("actions");
        let rel = action
            .path
            .strip_prefix(&actions_dir)
            .unwrap_or(&action.path)
            .to_string_lossy()
            .replace('\\', "/");
        parser::parse_function(&actions_dir, &rel, &action.function, &action.name)
    }

    /// Step 1+2+3 of §4.J: intrinsic actions for `profile`, concatenated
    /// with every tool a `(provider, module, tool)` edge exposes, mangled
    /// `external_<provider>_<name>` with a provider-tagged description.
    /// Collisions after mangling are a [`CoreError::CompositionError`].
    pub fn compose_tools(&self, module_id: &str, profile: &str) -> Result<Vec<ComposedTool>> {
        let kit = self.modules.get_kit_config(module_id)?;
        let resolved_profile = kit.profiles.get(profile).ok_or_else(|| {
            CoreError::MalformedKit(format!("module {module_id:?} has no profile {profile:?}"))
        })?;

        let mut seen_names: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for action in &resolved_profile.actions {
            let descriptor = Self::parse_action(&kit, action)?;
            if !seen_names.insert(descriptor.name.clone()) {
                return Err(CoreError::CompositionError(format!(
                    "duplicate intrinsic tool name {:?} in profile {profile:?}",
                    descriptor.name
                )));
            }
            out.push(ComposedTool { descriptor, provider_id: None });
        }

        let providers = self.provides.list_providers_to_receiver(module_id, ResourceKind::Tool)?;
        for edge in providers {
            let provider_kit = self.modules.get_kit_config(&edge.provider_id)?;
            for provided_tool in &provider_kit.provides.tools {
                let action = locate_provided_action(&provider_kit, &provided_tool.name)?;

                let mut descriptor = Self::parse_action(&provider_kit, action)?;
                let mangled = mangle_tool_name(&edge.provider_id, &descriptor.name);
                descriptor.description = format!("[From module: {}] {}", edge.provider_id, descriptor.description);
                descriptor.name = mangled.clone();

                if !seen_names.insert(mangled.clone()) {
                    return Err(CoreError::CompositionError(format!(
                        "tool name collision after mangling: {mangled:?}"
                    )));
                }
                out.push(ComposedTool { descriptor, provider_id: Some(edge.provider_id.clone()) });
            }
        }

        Ok(out)
    }

    /// §4.J step 4: intrinsic instruction text, then one
    /// `"Provided Instructions from Module: <id>"` block per `(kind =
    /// instruction)` provider edge, concatenating that provider kit's own
    /// `provide.instructions` file contents.
    pub fn compose_instructions(&self, module_id: &str, profile: &str) -> Result<String> {
        let kit = self.modules.get_kit_config(module_id)?;
        let resolved_profile = kit.profiles.get(profile).ok_or_else(|| {
            CoreError::MalformedKit(format!("module {module_id:?} has no profile {profile:?}"))
        })?;

        let mut instructions = match &resolved_profile.instruction_path {
            Some(path) => read_instruction_file(path)?,
            None => String::new(),
        };

        let providers = self.provides.list_providers_to_receiver(module_id, ResourceKind::Instruction)?;
        for edge in providers {
            let provider_kit = self.modules.get_kit_config(&edge.provider_id)?;
            let mut provider_text = String::new();
            for provided in &provider_kit.provides.instructions {
                if !provider_text.is_empty() {
                    provider_text.push_str("\n\n");
                }
                provider_text.push_str(&read_instruction_file(&provided.path)?);
            }
            instructions.push_str(&format!(
                "\n\nProvided Instructions from Module: {}\n{provider_text}",
                edge.provider_id
            ));
        }

        Ok(instructions)
    }

    /// The Bridge's `get_profile_metadata` verb (§4.I): instructions +
    /// action descriptors for `profile`, optionally unioned with what
    /// providers expose — i.e. exactly `compose_instructions` +
    /// `compose_tools` bundled together.
    pub fn profile_metadata(&self, module_id: &str, profile: &str) -> Result<ProfileMetadata> {
        Ok(ProfileMetadata {
            instructions: self.compose_instructions(module_id, profile)?,
            tools: self.compose_tools(module_id, profile)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProfileMetadata {
    pub instructions: String,
    pub tools: Vec<ComposedTool>,
}

/// Finds the action a provider kit's `provide.tools` entry named
/// `tool_name` resolves to, by way of that entry's declared `profile`.
/// Shared by [`ProfileComposer::compose_tools`] and the Bridge's
/// `execute_external_tool` dispatch, which needs the same lookup without
/// the name-mangling step.
pub fn locate_provided_action<'k>(
    provider_kit: &'k crate::kit::Kit,
    tool_name: &str,
) -> Result<&'k ResolvedAction> {
    let provided_tool = provider_kit
        .provides
        .tools
        .iter()
        .find(|t| t.name == tool_name)
        .ok_or_else(|| {
            CoreError::CompositionError(format!(
                "kit {:?} does not provide a tool named {tool_name:?}",
                provider_kit.kit_id
            ))
        })?;
    let provider_profile = provider_kit.profiles.get(&provided_tool.profile).ok_or_else(|| {
        CoreError::CompositionError(format!(
            "kit {:?} provides tool {tool_name:?} from unknown profile {:?}",
            provider_kit.kit_id, provided_tool.profile
        ))
    })?;
    provider_profile
        .actions
        .iter()
        .find(|a| a.name == provided_tool.name)
        .ok_or_else(|| {
            CoreError::CompositionError(format!(
                "kit {:?} provides tool {tool_name:?} but profile {:?} has no matching action",
                provider_kit.kit_id, provided_tool.profile
            ))
        })
}

/// `external_<provider_id>_<original>` (§4.I `get_provided_tools_schema`).
pub fn mangle_tool_name(provider_id: &str, original: &str) -> String {
    format!("external_{provider_id}_{original}")
}

/// Splits a mangled name back into `(provider_id, original)`. The provider
/// id segment is itself `_`-free (readable uids, §4.C), so splitting on
/// the first `_` after the `external_` prefix is unambiguous.
pub fn unmangle_tool_name(mangled: &str) -> Option<(&str, &str)> {
    let rest = mangled.strip_prefix("external_")?;
    rest.split_once('_')
}

fn read_instruction_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| CoreError::MalformedKit(format!("failed to read instruction file {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_and_unmangle_round_trip() {
        let mangled = mangle_tool_name("mod-abc123", "square");
        assert_eq!(mangled, "external_mod-abc123_square");
        assert_eq!(unmangle_tool_name(&mangled), Some(("mod-abc123", "square")));
    }

    #[test]
    fn unmangle_rejects_unprefixed_name() {
        assert_eq!(unmangle_tool_name("square"), None);
    }
}
