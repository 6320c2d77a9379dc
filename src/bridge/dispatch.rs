//! Verb table for the Platform Bridge (§4.I). One function per row of the
//! spec's verb table; [`dispatch`] is the single entry point the event
//! loop calls per posted request.

use super::{BridgeComponents, ModuleProfileParams, SUPPORTED_CONTENT_TYPES};
use crate::chat_history::{ChatMessage, MessageBody, Role};
use crate::composer;
use crate::doc_store::Filter;
use crate::error::{CoreError, Result};
use crate::llm::ChatCompletionRequest;
use crate::provides::ResourceKind;
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn dispatch(components: &BridgeComponents, verb: &str, params: Value) -> Result<Value> {
    match verb {
        "ping" => Ok(json!({"pong": true})),
        "generate_uuid" => Ok(json!(uuid::Uuid::new_v4().to_string())),
        "generate_readable_uid" => {
            #[derive(Deserialize)]
            struct P {
                #[serde(default = "default_prefix")]
                prefix: String,
            }
            fn default_prefix() -> String {
                "id".to_string()
            }
            let p: P = parse(params)?;
            Ok(json!(crate::util::generate_readable_uid(&p.prefix)))
        }
        "get_supported_content_types" => Ok(json!(SUPPORTED_CONTENT_TYPES)),

        "add_message" => add_message(components, params).await,
        "get_messages" => get_messages(components, params).await,
        "chat_completion" => chat_completion(components, params).await,
        "structured_output" => structured_output(components, params).await,
        "get_profile_metadata" => get_profile_metadata(components, params).await,

        "read_file" => read_file(components, params).await,
        "write_file" => write_file(components, params).await,
        "list_files" => list_files(components, params).await,
        "get_repo_tree" => get_repo_tree(components, params).await,

        "profile_store_find" => profile_store_find(components, params).await,
        "profile_store_set_value" => profile_store_set_value(components, params).await,
        "profile_store_set_many" => profile_store_set_many(components, params).await,
        "profile_store_update" => profile_store_update(components, params).await,
        "profile_store_delete" => profile_store_delete(components, params).await,
        "profile_store_get_by_id" => profile_store_get_by_id(components, params).await,

        "get_provided_tools_schema" => get_provided_tools_schema(components, params).await,
        "execute_external_tool" => execute_external_tool(components, params).await,

        other => Err(CoreError::PlatformCallFailed { message: format!("unknown bridge verb {other:?}") }),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| CoreError::PlatformCallFailed {
        message: format!("malformed parameters: {e}"),
    })
}

#[derive(Deserialize)]
struct SessionParams {
    module_id: String,
    profile: String,
    #[serde(default = "default_session")]
    session_id: String,
}

fn default_session() -> String {
    crate::chat_history::DEFAULT_SESSION_ID.to_string()
}

async fn add_message(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        module_id: String,
        profile: String,
        #[serde(default = "default_session")]
        session_id: String,
        role: Role,
        body: MessageBody,
    }
    let p: P = parse(params)?;
    let message: ChatMessage =
        components.chat_history.add_message(&p.module_id, &p.profile, &p.session_id, p.role, p.body)?;
    Ok(serde_json::to_value(message)?)
}

async fn get_messages(components: &BridgeComponents, params: Value) -> Result<Value> {
    let p: SessionParams = parse(params)?;
    let messages = components.chat_history.get_messages(&p.module_id, &p.profile, &p.session_id)?;
    Ok(serde_json::to_value(messages)?)
}

async fn chat_completion(components: &BridgeComponents, params: Value) -> Result<Value> {
    let request: ChatCompletionRequest = parse(params)?;
    let response = components.gateway.chat_completion(&request).await?;
    Ok(json!({
        "message": response.message,
        "finish_reason": response.finish_reason,
        "raw": response.raw,
    }))
}

async fn structured_output(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        #[serde(flatten)]
        request: ChatCompletionRequest,
        schema: Value,
    }
    let p: P = parse(params)?;
    let (parsed, completion) = components.gateway.structured_output(&p.request, &p.schema).await?;
    Ok(json!({
        "parsed": parsed,
        "completion": {
            "message": completion.message,
            "finish_reason": completion.finish_reason,
            "raw": completion.raw,
        },
    }))
}

async fn get_profile_metadata(components: &BridgeComponents, params: Value) -> Result<Value> {
    let p: ModuleProfileParams = parse(params)?;
    let metadata = components.composer().profile_metadata(&p.module_id, &p.profile)?;
    Ok(json!({
        "instructions": metadata.instructions,
        "tools": metadata.tools.iter().map(composed_tool_json).collect::<Vec<_>>(),
    }))
}

fn composed_tool_json(tool: &composer::ComposedTool) -> Value {
    json!({
        "name": &tool.descriptor.name,
        "description": &tool.descriptor.description,
        "is_async": tool.descriptor.is_async,
        "parameters": &tool.descriptor.parameters,
        "provider_id": &tool.provider_id,
    })
}

#[derive(Deserialize)]
struct ModuleOnlyParams {
    module_id: String,
}

fn workspace_name_for(components: &BridgeComponents, module_id: &str) -> Result<String> {
    Ok(components.modules.get(module_id)?.workspace_name)
}

async fn read_file(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        module_id: String,
        rel_path: String,
    }
    let p: P = parse(params)?;
    let workspace_name = workspace_name_for(components, &p.module_id)?;
    let content = components.workspace_store.read_file(&workspace_name, &p.rel_path)?;
    Ok(json!({ "content_base64": base64_encode(&content) }))
}

async fn write_file(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        module_id: String,
        rel_path: String,
        content_base64: String,
    }
    let p: P = parse(params)?;
    let workspace_name = workspace_name_for(components, &p.module_id)?;
    let content = base64_decode(&p.content_base64)?;
    components.workspace_store.update_file(&workspace_name, &p.rel_path, &content)?;
    Ok(json!({ "ok": true }))
}

async fn list_files(components: &BridgeComponents, params: Value) -> Result<Value> {
    let p: ModuleOnlyParams = parse(params)?;
    let workspace_name = workspace_name_for(components, &p.module_id)?;
    let files = components.workspace_store.list_files(&workspace_name)?;
    Ok(json!(files))
}

async fn get_repo_tree(components: &BridgeComponents, params: Value) -> Result<Value> {
    let p: ModuleOnlyParams = parse(params)?;
    let workspace_name = workspace_name_for(components, &p.module_id)?;
    let files = components.workspace_store.list_files(&workspace_name)?;
    Ok(build_tree(&files))
}

/// Folds a flat list of `a/b/c.py`-style relative paths into a nested
/// `{dir: {...}, file: null}` JSON tree for `get_repo_tree`.
fn build_tree(files: &[String]) -> Value {
    let mut root = serde_json::Map::new();
    for path in files {
        let mut cursor = &mut root;
        let parts: Vec<&str> = path.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            if i == parts.len() - 1 {
                cursor.insert(part.to_string(), Value::Null);
            } else {
                let entry = cursor
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                cursor = entry.as_object_mut().expect("directory entries are always objects");
            }
        }
    }
    Value::Object(root)
}

#[derive(Deserialize)]
struct CollectionParams {
    module_id: String,
    profile: String,
    collection: String,
}

async fn profile_store_find(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        #[serde(flatten)]
        scope: CollectionParams,
        #[serde(default)]
        filter: Filter,
    }
    let p: P = parse(params)?;
    let rows = components.doc_store.find(&p.scope.module_id, &p.scope.profile, &p.scope.collection, &p.filter)?;
    Ok(serde_json::to_value(rows)?)
}

async fn profile_store_set_value(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        #[serde(flatten)]
        scope: CollectionParams,
        value: Value,
    }
    let p: P = parse(params)?;
    let row = components.doc_store.set_value(&p.scope.module_id, &p.scope.profile, &p.scope.collection, p.value)?;
    Ok(serde_json::to_value(row)?)
}

async fn profile_store_set_many(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        #[serde(flatten)]
        scope: CollectionParams,
        values: Vec<Value>,
    }
    let p: P = parse(params)?;
    let rows =
        components.doc_store.set_many(&p.scope.module_id, &p.scope.profile, &p.scope.collection, p.values)?;
    Ok(serde_json::to_value(rows)?)
}

async fn profile_store_update(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        #[serde(flatten)]
        scope: CollectionParams,
        filter: Filter,
        new_value: Value,
    }
    let p: P = parse(params)?;
    let count = components.doc_store.update(
        &p.scope.module_id,
        &p.scope.profile,
        &p.scope.collection,
        &p.filter,
        p.new_value,
    )?;
    Ok(json!({ "updated": count }))
}

async fn profile_store_delete(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        #[serde(flatten)]
        scope: CollectionParams,
        filter: Filter,
    }
    let p: P = parse(params)?;
    let count =
        components.doc_store.delete(&p.scope.module_id, &p.scope.profile, &p.scope.collection, &p.filter)?;
    Ok(json!({ "deleted": count }))
}

async fn profile_store_get_by_id(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        id: String,
    }
    let p: P = parse(params)?;
    let row = components.doc_store.get_by_id(&p.id)?;
    Ok(serde_json::to_value(row)?)
}

async fn get_provided_tools_schema(components: &BridgeComponents, params: Value) -> Result<Value> {
    let p: ModuleProfileParams = parse(params)?;
    let tools = components.composer().compose_tools(&p.module_id, &p.profile)?;
    let provided: Vec<Value> = tools.iter().filter(|t| t.provider_id.is_some()).map(composed_tool_json).collect();
    Ok(json!(provided))
}

async fn execute_external_tool(components: &BridgeComponents, params: Value) -> Result<Value> {
    #[derive(Deserialize)]
    struct P {
        module_id: String,
        tool_name: String,
        #[serde(default)]
        parameters: Value,
    }
    let p: P = parse(params)?;
    let (provider_id, original_name) = composer::unmangle_tool_name(&p.tool_name).ok_or_else(|| {
        CoreError::CompositionError(format!("{:?} is not an external tool name", p.tool_name))
    })?;

    if !components.provides.has_edge(provider_id, &p.module_id, ResourceKind::Tool)? {
        return Err(CoreError::CapabilityDenied {
            provider: provider_id.to_string(),
            receiver: p.module_id.clone(),
            kind: ResourceKind::Tool.to_string(),
        });
    }

    let provider_kit = components.modules.get_kit_config(provider_id)?;
    let action = composer::locate_provided_action(&provider_kit, original_name)?.clone();
    let provider_module = components.modules.get(provider_id)?;

    let image_tag = components
        .image_cache
        .get_or_build(&provider_kit.base_image, &provider_kit.dependencies)
        .await?;
    let workspace_root = components.workspace_store.root(&provider_module.workspace_name);
    let env = env_object_to_vec(&provider_module.env_vars);

    let container_id = components
        .warm_pool
        .acquire(&provider_module.workspace_name, &image_tag, &workspace_root, &provider_kit.ports, env)
        .await?;
    let result = components
        .warm_pool
        .execute_tool(&provider_module.workspace_name, &container_id, &workspace_root, &action, &p.parameters)
        .await?;
    components.warm_pool.touch(&provider_module.workspace_name).await;
    Ok(result)
}

fn env_object_to_vec(env_vars: &Value) -> Vec<String> {
    env_vars
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| format!("{k}={}", value_to_env_string(v)))
                .collect()
        })
        .unwrap_or_default()
}

fn value_to_env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| CoreError::PlatformCallFailed { message: format!("invalid base64 payload: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tree_nests_directories() {
        let tree = build_tree(&["a.txt".to_string(), "dir/b.txt".to_string(), "dir/sub/c.txt".to_string()]);
        let obj = tree.as_object().unwrap();
        assert!(obj.contains_key("a.txt"));
        let dir = obj.get("dir").unwrap().as_object().unwrap();
        assert!(dir.contains_key("b.txt"));
        assert!(dir.get("sub").unwrap().as_object().unwrap().contains_key("c.txt"));
    }

    #[test]
    fn base64_round_trips() {
        let encoded = base64_encode(b"hello world");
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, b"hello world");
    }

    #[test]
    fn execute_external_tool_rejects_non_mangled_name() {
        assert!(composer::unmangle_tool_name("square").is_none());
    }
}
