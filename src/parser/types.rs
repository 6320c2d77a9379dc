//! Source-annotation → JSON-schema type mapping (§4.E table).
//!
//! Works off the annotation's source text rather than a structured type
//! AST — subscripted generics (`list[dict]`, `Optional[int]`, ...) are
//! split on their brackets/commas by hand, matching the pack's general
//! preference for `regex`/text-driven lightweight extraction over a
//! second grammar.

use serde_json::{json, Value};

pub fn map_annotation(raw: &str) -> Value {
    let ty = raw.trim();
    match ty.find('[') {
        Some(idx) if ty.ends_with(']') => {
            let head = ty[..idx].trim().to_lowercase();
            let inner = &ty[idx + 1..ty.len() - 1];
            let parts = split_top_level(inner);
            map_generic(&head, &parts)
        }
        _ => map_scalar(&ty.to_lowercase()),
    }
}

fn map_scalar(ty: &str) -> Value {
    match ty {
        "str" => json!({"type": "string"}),
        "int" => json!({"type": "integer"}),
        "float" => json!({"type": "number"}),
        "bool" => json!({"type": "boolean"}),
        _ => json!({"type": "object"}),
    }
}

fn map_generic(head: &str, parts: &[String]) -> Value {
    match head {
        "list" => {
            let item = parts.first().map(|s| map_annotation(s)).unwrap_or(json!({"type": "object"}));
            json!({"type": "array", "items": item})
        }
        "dict" => {
            let value_ty = parts.get(1).map(|s| map_annotation(s)).unwrap_or(json!({"type": "object"}));
            json!({"type": "object", "additionalProperties": value_ty})
        }
        "optional" => {
            let mut schema = parts.first().map(|s| map_annotation(s)).unwrap_or(json!({"type": "object"}));
            add_null_type(&mut schema);
            schema
        }
        "union" => map_union(parts),
        "literal" => {
            let values: Vec<Value> = parts
                .iter()
                .map(|p| json!(p.trim().trim_matches(|c| c == '"' || c == '\'')))
                .collect();
            json!({"type": "string", "enum": values})
        }
        _ => json!({"type": "object"}),
    }
}

fn map_union(parts: &[String]) -> Value {
    let mut has_null = false;
    let mut variants = Vec::new();
    for part in parts {
        if part.trim().eq_ignore_ascii_case("none") {
            has_null = true;
        } else {
            variants.push(map_annotation(part));
        }
    }
    match variants.len() {
        0 => json!({"type": "null"}),
        1 => {
            let mut schema = variants.into_iter().next().unwrap();
            if has_null {
                add_null_type(&mut schema);
            }
            schema
        }
        _ => {
            // §4.E: "drops `null` into `type` list" — folded into the
            // oneOf as an explicit null variant since there is no single
            // `type` field to widen across multiple oneOf branches.
            if has_null {
                variants.push(json!({"type": "null"}));
            }
            json!({"oneOf": variants})
        }
    }
}

fn add_null_type(schema: &mut Value) {
    let Some(current) = schema.get("type").cloned() else {
        return;
    };
    let widened = match current {
        Value::String(s) => json!([s, "null"]),
        Value::Array(mut items) => {
            if !items.iter().any(|v| v == "null") {
                items.push(json!("null"));
            }
            Value::Array(items)
        }
        other => other,
    };
    schema["type"] = widened;
}

/// Splits `s` on commas that are not nested inside brackets, so
/// `dict[str, list[int]]`'s inner `str, list[int]` splits into exactly
/// two parts.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_scalars() {
        assert_eq!(map_annotation("str"), json!({"type": "string"}));
        assert_eq!(map_annotation("int"), json!({"type": "integer"}));
        assert_eq!(map_annotation("float"), json!({"type": "number"}));
        assert_eq!(map_annotation("bool"), json!({"type": "boolean"}));
        assert_eq!(map_annotation("SomeCustomType"), json!({"type": "object"}));
    }

    #[test]
    fn maps_list_and_dict() {
        assert_eq!(
            map_annotation("list[dict]"),
            json!({"type": "array", "items": {"type": "object"}})
        );
        assert_eq!(
            map_annotation("dict[str, int]"),
            json!({"type": "object", "additionalProperties": {"type": "integer"}})
        );
    }

    #[test]
    fn maps_optional_and_literal() {
        assert_eq!(
            map_annotation("optional[str]"),
            json!({"type": ["string", "null"]})
        );
        assert_eq!(
            map_annotation("literal[\"a\", \"b\"]"),
            json!({"type": "string", "enum": ["a", "b"]})
        );
    }
}
