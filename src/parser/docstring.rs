//! Docstring parsing (§4.E): first-paragraph description plus per-parameter
//! descriptions from a Google-style `Args:` block or a numpy/reST
//! `Parameters` block. Regex-assisted line scan rather than a second
//! parser, matching the pack's preference for lightweight text extraction.

use std::collections::HashMap;
use std::sync::OnceLock;

fn google_param_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(\([^)]*\))?\s*:\s*(.*)$").unwrap())
}

fn numpy_param_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*:\s*\S.*$").unwrap())
}

pub struct ParsedDocstring {
    pub description: Option<String>,
    pub param_descriptions: HashMap<String, String>,
}

/// `doc` is the raw docstring content (already stripped of quote markers).
pub fn parse(doc: &str) -> ParsedDocstring {
    let normalized = dedent(doc);
    let lines: Vec<&str> = normalized.lines().collect();

    let description = first_paragraph(&lines);
    let param_descriptions = google_args_block(&lines)
        .or_else(|| numpy_parameters_block(&lines))
        .unwrap_or_default();

    ParsedDocstring {
        description,
        param_descriptions,
    }
}

fn dedent(doc: &str) -> String {
    let min_indent = doc
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    doc.lines()
        .enumerate()
        .map(|(i, l)| if i == 0 { l.to_string() } else { l.get(min_indent..).unwrap_or("").to_string() })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The docstring's first paragraph (§4.E "description = first paragraph of
/// the docstring").
fn first_paragraph(lines: &[&str]) -> Option<String> {
    let mut paragraph = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        if is_section_header(line.trim()) {
            break;
        }
        paragraph.push(line.trim());
    }
    if paragraph.is_empty() {
        None
    } else {
        Some(paragraph.join(" "))
    }
}

fn is_section_header(line: &str) -> bool {
    matches!(
        line.trim_end_matches(':'),
        "Args" | "Arguments" | "Parameters" | "Returns" | "Raises" | "Yields"
    )
}

fn google_args_block(lines: &[&str]) -> Option<HashMap<String, String>> {
    let start = lines.iter().position(|l| l.trim().trim_end_matches(':') == "Args" || l.trim().trim_end_matches(':') == "Arguments")?;
    let mut out = HashMap::new();
    let mut current: Option<(String, String)> = None;
    for line in &lines[start + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        if is_section_header(line.trim()) {
            break;
        }
        if let Some(caps) = google_param_re().captures(line) {
            if let Some((name, desc)) = current.take() {
                out.insert(name, desc);
            }
            let name = caps.get(1).unwrap().as_str().to_string();
            let desc = caps.get(3).unwrap().as_str().trim().to_string();
            current = Some((name, desc));
        } else if let Some((_, desc)) = current.as_mut() {
            desc.push(' ');
            desc.push_str(line.trim());
        }
    }
    if let Some((name, desc)) = current {
        out.insert(name, desc);
    }
    Some(out)
}

fn numpy_parameters_block(lines: &[&str]) -> Option<HashMap<String, String>> {
    let start = lines.iter().position(|l| l.trim() == "Parameters")?;
    // Skip the `----------` underline, if present.
    let body_start = if lines.get(start + 1).map(|l| l.trim().chars().all(|c| c == '-')).unwrap_or(false) {
        start + 2
    } else {
        start + 1
    };
    let mut out = HashMap::new();
    let mut current: Option<(String, String)> = None;
    for line in &lines[body_start..] {
        if line.trim().is_empty() {
            continue;
        }
        if is_section_header(line.trim()) {
            break;
        }
        if numpy_param_re().is_match(line) && !line.starts_with(' ') {
            if let Some((name, desc)) = current.take() {
                out.insert(name, desc);
            }
            let name = line.split(':').next().unwrap().trim().to_string();
            current = Some((name, String::new()));
        } else if let Some((_, desc)) = current.as_mut() {
            if !desc.is_empty() {
                desc.push(' ');
            }
            desc.push_str(line.trim());
        }
    }
    if let Some((name, desc)) = current {
        out.insert(name, desc);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_google_style_args_block() {
        let doc = "Compute\n\nArgs:\n    items: the rows\n    factor: the scale";
        let parsed = parse(doc);
        assert_eq!(parsed.description.as_deref(), Some("Compute"));
        assert_eq!(parsed.param_descriptions.get("items").map(|s| s.as_str()), Some("the rows"));
        assert_eq!(parsed.param_descriptions.get("factor").map(|s| s.as_str()), Some("the scale"));
    }
}
