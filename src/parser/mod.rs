//! Function Parser (§4.E) — static analysis of a callable source file
//! producing a JSON-schema tool descriptor.
//!
//! Structural work (locating the function, reading its parameter list)
//! uses `tree-sitter`/`tree-sitter-python`; type annotations and
//! docstrings are handled as text by [`types`]/[`docstring`] — the
//! pack's closest analog is `stencila`'s `parser-python`/
//! `parser-treesitter` pairing, followed here for the same dependency
//! shape since no bespoke Python AST crate appears elsewhere in the
//! corpus.

mod docstring;
mod types;

use crate::error::{CoreError, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Parser};

/// Recursion guard on `from X import name` re-export chains — the
/// original Python has no explicit bound here; this core intentionally
/// tightens the contract (see DESIGN.md).
const MAX_IMPORT_DEPTH: u32 = 16;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub is_async: bool,
    pub parameters: Value,
}

/// Parses `(actions_dir, file_rel_path, function_name)` into a tool
/// descriptor (§4.E). `name` on the returned descriptor is the caller's
/// action `name`, not necessarily the Python function's own name.
pub fn parse_function(
    actions_dir: &Path,
    file_rel_path: &str,
    function_name: &str,
    descriptor_name: &str,
) -> Result<ToolDescriptor> {
    let mut visited = HashSet::new();
    let mut descriptor = resolve(actions_dir, file_rel_path, function_name, 0, &mut visited)?;
    descriptor.name = descriptor_name.to_string();
    Ok(descriptor)
}

fn resolve(
    actions_dir: &Path,
    file_rel_path: &str,
    function_name: &str,
    depth: u32,
    visited: &mut HashSet<(PathBuf, String)>,
) -> Result<ToolDescriptor> {
    if depth > MAX_IMPORT_DEPTH {
        return Err(CoreError::FunctionNotFound(format!(
            "import chain exceeded depth {MAX_IMPORT_DEPTH} resolving {function_name:?}"
        )));
    }

    let file_path = resolve_module_file(actions_dir, file_rel_path)?;
    let key = (file_path.clone(), function_name.to_string());
    if !visited.insert(key) {
        return Err(CoreError::FunctionNotFound(format!(
            "cyclic import resolving {function_name:?} via {file_path:?}"
        )));
    }

    let source = std::fs::read_to_string(&file_path)
        .map_err(|e| CoreError::FunctionNotFound(format!("{file_path:?}: {e}")))?;

    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .map_err(|e| CoreError::ToolError(format!("tree-sitter init failed: {e}")))?;
    let tree = parser
        .parse(&source, None)
        .ok_or_else(|| CoreError::MalformedKit(format!("failed to parse {file_path:?}")))?;

    if let Some(node) = find_top_level_function(tree.root_node(), &source, function_name) {
        return build_descriptor(node, &source);
    }

    if let Some((module_path, imported_as)) = find_reexport(tree.root_node(), &source, function_name) {
        let next_rel = resolve_import_target(file_rel_path, &module_path);
        return resolve(actions_dir, &next_rel, &imported_as, depth + 1, visited);
    }

    Err(CoreError::FunctionNotFound(format!(
        "{function_name} not found in {file_rel_path} and no re-export chain resolves it"
    )))
}

fn resolve_module_file(actions_dir: &Path, file_rel_path: &str) -> Result<PathBuf> {
    let mut candidate = actions_dir.join(file_rel_path);
    if candidate.extension().is_none() {
        candidate.set_extension("py");
    }
    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(CoreError::FunctionNotFound(format!(
            "no such module file {candidate:?}"
        )))
    }
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn find_top_level_function<'a>(root: Node<'a>, source: &str, name: &str) -> Option<Node<'a>> {
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        let func_node = match child.kind() {
            "function_definition" => Some(child),
            "decorated_definition" => child
                .children(&mut child.walk())
                .find(|c| c.kind() == "function_definition"),
            _ => None,
        };
        if let Some(func_node) = func_node {
            if let Some(name_node) = func_node.child_by_field_name("name") {
                if node_text(name_node, source) == name {
                    return Some(func_node);
                }
            }
        }
    }
    None
}

fn build_descriptor(func_node: Node, source: &str) -> Result<ToolDescriptor> {
    let name_node = func_node
        .child_by_field_name("name")
        .ok_or_else(|| CoreError::MalformedKit("function definition has no name".into()))?;
    let name = node_text(name_node, source).to_string();

    let is_async = func_node
        .child(0)
        .map(|c| node_text(c, source) == "async")
        .unwrap_or(false);

    let docstring = extract_docstring(func_node, source);
    let parsed_doc = docstring.as_deref().map(docstring::parse);

    let description = parsed_doc
        .as_ref()
        .and_then(|d| d.description.clone())
        .unwrap_or_else(|| format!("Execute the {name} action"));

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    if let Some(params_node) = func_node.child_by_field_name("parameters") {
        let mut cursor = params_node.walk();
        for param in params_node.children(&mut cursor) {
            if let Some((param_name, schema, has_default)) = parse_parameter(param, source) {
                if param_name == "self" {
                    continue;
                }
                let mut schema = schema;
                if let Some(desc) = parsed_doc
                    .as_ref()
                    .and_then(|d| d.param_descriptions.get(&param_name))
                {
                    schema["description"] = json!(desc);
                } else {
                    schema["description"] = json!(format!("Parameter {param_name}"));
                }
                if !has_default {
                    required.push(param_name.clone());
                }
                properties.insert(param_name, schema);
            }
        }
    }

    Ok(ToolDescriptor {
        name,
        description,
        is_async,
        parameters: json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
            "additionalProperties": false,
        }),
    })
}

/// Returns `(name, schema-without-description, has_default)` for one
/// parameter child node, or `None` for separators (`,`, `*`, `/`).
fn parse_parameter(node: Node, source: &str) -> Option<(String, Value, bool)> {
    match node.kind() {
        "identifier" => Some((node_text(node, source).to_string(), json!({"type": "object"}), false)),
        "typed_parameter" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())?;
            let ty = node
                .child_by_field_name("type")
                .map(|n| types::map_annotation(node_text(n, source)))
                .unwrap_or(json!({"type": "object"}));
            Some((name, ty, false))
        }
        "default_parameter" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())?;
            Some((name, json!({"type": "object"}), true))
        }
        "typed_default_parameter" => {
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(n, source).to_string())?;
            let ty = node
                .child_by_field_name("type")
                .map(|n| types::map_annotation(node_text(n, source)))
                .unwrap_or(json!({"type": "object"}));
            Some((name, ty, true))
        }
        _ => None,
    }
}

/// Finds the function's docstring: the first statement in its body, if
/// that statement is a bare string expression.
fn extract_docstring(func_node: Node, source: &str) -> Option<String> {
    let body = func_node.child_by_field_name("body")?;
    let mut cursor = body.walk();
    let first_stmt = body.children(&mut cursor).find(|c| c.is_named())?;
    if first_stmt.kind() != "expression_statement" {
        return None;
    }
    let string_node = first_stmt.named_child(0)?;
    if string_node.kind() != "string" {
        return None;
    }
    let raw = node_text(string_node, source);
    Some(strip_string_quotes(raw))
}

fn strip_string_quotes(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(body) = trimmed.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return body.to_string();
        }
    }
    trimmed.to_string()
}

/// Scans top-level `from X import name [as alias]` statements for one
/// re-exporting `function_name`. Returns `(module_path, name_in_module)`.
fn find_reexport(root: Node, source: &str, function_name: &str) -> Option<(String, String)> {
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        if child.kind() != "import_from_statement" {
            continue;
        }
        let module_node = child.child_by_field_name("module_name")?;
        let module_path = node_text(module_node, source).to_string();

        let mut inner = child.walk();
        for name_node in child.children(&mut inner) {
            if name_node.kind() == "dotted_name" || name_node.kind() == "identifier" {
                let text = node_text(name_node, source);
                if text == function_name {
                    return Some((module_path, function_name.to_string()));
                }
            } else if name_node.kind() == "aliased_import" {
                let alias = name_node.child_by_field_name("alias").map(|n| node_text(n, source));
                let original = name_node.child_by_field_name("name").map(|n| node_text(n, source));
                if alias == Some(function_name) {
                    if let Some(original) = original {
                        return Some((module_path, original.to_string()));
                    }
                }
            }
        }
    }
    None
}

/// Resolves an import's module path (which may start with `.`/`..` for
/// relative imports) against the file that contains the import, producing
/// a new `file_rel_path` rooted at `actions_dir`.
fn resolve_import_target(importing_file_rel_path: &str, module_path: &str) -> String {
    let importing_dir = Path::new(importing_file_rel_path)
        .parent()
        .unwrap_or_else(|| Path::new(""));

    let leading_dots = module_path.chars().take_while(|c| *c == '.').count();
    let remainder = &module_path[leading_dots..];

    let mut base = importing_dir.to_path_buf();
    // One leading dot means "this package"; each extra dot walks up one
    // directory level.
    for _ in 1..leading_dots {
        base = base.parent().unwrap_or(Path::new("")).to_path_buf();
    }
    if leading_dots == 0 {
        base = PathBuf::new();
    }

    for segment in remainder.split('.').filter(|s| !s.is_empty()) {
        base = base.join(segment);
    }
    base.to_string_lossy().replace('\\', "/")
}

/// The Agent Runner's tool schema probe (§4.H): scans every `.py` file
/// directly under `agents_dir` for a top-level class named `class_name`
/// and, if found, emits a descriptor per method decorated `@tool`.
/// Returns `Ok(None)` when no file defines that class, so the caller can
/// fall back to the next candidate file.
pub fn parse_agent_tool_methods(agents_dir: &Path, class_name: &str) -> Result<Option<Vec<ToolDescriptor>>> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .map_err(|e| CoreError::ToolError(format!("tree-sitter init failed: {e}")))?;

    let entries = match std::fs::read_dir(agents_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let Ok(source) = std::fs::read_to_string(&path) else { continue };
        let Some(tree) = parser.parse(&source, None) else { continue };

        if let Some(class_node) = find_top_level_class(tree.root_node(), &source, class_name) {
            return Ok(Some(tool_methods_of_class(class_node, &source)?));
        }
    }

    Ok(None)
}

fn find_top_level_class<'a>(root: Node<'a>, source: &str, name: &str) -> Option<Node<'a>> {
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        let class_node = match child.kind() {
            "class_definition" => Some(child),
            "decorated_definition" => child
                .children(&mut child.walk())
                .find(|c| c.kind() == "class_definition"),
            _ => None,
        };
        if let Some(class_node) = class_node {
            if let Some(name_node) = class_node.child_by_field_name("name") {
                if node_text(name_node, source) == name {
                    return Some(class_node);
                }
            }
        }
    }
    None
}

/// Every method inside `class_node` carrying a decorator literally named
/// `tool` (`@tool` or `@tool(...)`), built into a descriptor the same way
/// a top-level action function is.
fn tool_methods_of_class(class_node: Node, source: &str) -> Result<Vec<ToolDescriptor>> {
    let body = class_node
        .child_by_field_name("body")
        .ok_or_else(|| CoreError::MalformedKit("class definition has no body".into()))?;

    let mut descriptors = Vec::new();
    let mut cursor = body.walk();
    for child in body.children(&mut cursor) {
        if child.kind() != "decorated_definition" {
            continue;
        }
        let has_tool_decorator = child
            .children(&mut child.walk())
            .filter(|c| c.kind() == "decorator")
            .any(|decorator| decorator_name(decorator, source) == "tool");
        if !has_tool_decorator {
            continue;
        }
        if let Some(func_node) = child
            .children(&mut child.walk())
            .find(|c| c.kind() == "function_definition")
        {
            descriptors.push(build_descriptor(func_node, source)?);
        }
    }
    Ok(descriptors)
}

/// `@tool` -> `"tool"`, `@tool(name="x")` -> `"tool"`.
fn decorator_name<'a>(decorator: Node<'a>, source: &'a str) -> &'a str {
    let inner = decorator.named_child(0).unwrap_or(decorator);
    let head = match inner.kind() {
        "call" => inner.child_by_field_name("function").unwrap_or(inner),
        _ => inner,
    };
    node_text(head, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_typed_function_with_args_docstring() {
        let dir = tempfile::tempdir().unwrap();
        let source = "def process(items: list[dict], factor: float = 1.5):\n    \"\"\"Compute\n\n    Args:\n        items: the rows\n        factor: the scale\n    \"\"\"\n    return items\n";
        fs::write(dir.path().join("tools.py"), source).unwrap();

        let descriptor = parse_function(dir.path(), "tools.py", "process", "process").unwrap();
        let params = &descriptor.parameters["properties"];
        assert_eq!(params["items"]["type"], json!("array"));
        assert_eq!(params["items"]["items"]["type"], json!("object"));
        assert_eq!(params["items"]["description"], json!("the rows"));
        assert_eq!(params["factor"]["type"], json!("number"));
        assert_eq!(descriptor.parameters["required"], json!(["items"]));
    }

    #[test]
    fn follows_reexport_chain() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("impl.py"),
            "def real_tool(x: int):\n    \"\"\"Doubles x\"\"\"\n    return x * 2\n",
        )
        .unwrap();
        fs::write(dir.path().join("facade.py"), "from .impl import real_tool\n").unwrap();

        let descriptor = parse_function(dir.path(), "facade.py", "real_tool", "double").unwrap();
        assert_eq!(descriptor.name, "double");
        assert_eq!(descriptor.description, "Doubles x");
    }

    #[test]
    fn missing_function_is_function_not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tools.py"), "def other():\n    pass\n").unwrap();
        let err = parse_function(dir.path(), "tools.py", "missing", "missing").unwrap_err();
        assert!(matches!(err, CoreError::FunctionNotFound(_)));
    }

    #[test]
    fn finds_tool_decorated_methods_on_named_class() {
        let dir = tempfile::tempdir().unwrap();
        let source = "class SupportAgent(Agent):\n    def helper(self):\n        pass\n\n    @tool\n    def lookup(self, order_id: str):\n        \"\"\"Looks up an order\"\"\"\n        pass\n\n    @tool(name=\"other\")\n    def refund(self, order_id: str, amount: float = 0.0):\n        pass\n";
        fs::write(dir.path().join("__init__.py"), source).unwrap();

        let descriptors = parse_agent_tool_methods(dir.path(), "SupportAgent").unwrap().unwrap();
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["lookup", "refund"]);
        assert_eq!(descriptors[0].description, "Looks up an order");
    }

    #[test]
    fn tool_method_probe_returns_none_for_unknown_class() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("__init__.py"), "class Other:\n    pass\n").unwrap();
        assert!(parse_agent_tool_methods(dir.path(), "SupportAgent").unwrap().is_none());
    }
}
