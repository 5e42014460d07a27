//! Recovery of facts from JSON-shaped model output.

use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::Cluster;
use serde_json::Value;

/// Per-object regex used to salvage facts from truncated JSON. Backends with
/// schema hints still return cut-off arrays when `max_tokens` is hit.
static FACT_OBJ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)\{\s*"(?:cluster|CLUSTER|c|C)"\s*:\s*"(?P<cluster>[^"]+)"\s*,\s*"(?:keyword|KEYWORD|k|K)"\s*:\s*"(?P<keyword>[^"]+)"\s*,\s*"(?:value|VALUE|v|V)"\s*:\s*(?P<value>"[^"]*"|-?\d+(?:\.\d+)?|true|false|null)\s*,\s*"(?:timestamp|TIMESTAMP|t|T)"\s*:\s*"(?P<timestamp>[^"]+)"\s*\}"#,
    )
    .expect("fact object regex")
});

fn value_field(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        _ => None,
    }
}

fn field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let map = obj.as_object()?;
    for n in names {
        if let Some(v) = map.get(*n) {
            return Some(v);
        }
    }
    None
}

/// One fact object → one line. Cluster may be omitted when a grouping key
/// already provides it; timestamp defaults to `Unknown`.
fn fact_from_object(obj: &Value, cluster_hint: Option<&str>) -> Option<String> {
    let cluster = field(obj, &["cluster", "CLUSTER", "c", "C"])
        .and_then(value_field)
        .or_else(|| cluster_hint.map(str::to_string))?;
    let keyword = field(obj, &["keyword", "KEYWORD", "k", "K"]).and_then(value_field)?;
    let value = field(obj, &["value", "VALUE", "v", "V"])
        .and_then(value_field)
        .map(|v| v.trim_start_matches('$').trim().to_string())?;
    let timestamp = field(obj, &["timestamp", "TIMESTAMP", "t", "T"])
        .and_then(value_field)
        .unwrap_or_else(|| "Unknown".to_string());
    if cluster.is_empty() || keyword.is_empty() || value.is_empty() {
        return None;
    }
    Some(format!("{cluster}|{keyword}|{value}|{timestamp}"))
}

/// Recover lines from a parsed JSON value:
/// - array of fact objects (or of pre-formatted strings)
/// - `{"facts": [...]}` wrappers (also `toon_facts`, `fact_lines`, `lines`)
/// - grouped form `{"VITALS": [{K,V,T}, ...], ...}`
pub fn facts_from_json(root: &Value) -> Vec<String> {
    let mut out = Vec::new();

    match root {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) if s.contains('|') => out.push(s.trim().to_string()),
                    Value::Object(_) => {
                        if let Some(line) = fact_from_object(item, None) {
                            out.push(line);
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Object(map) => {
            for key in ["facts", "toon_facts", "kvt_facts", "fact_lines", "lines"] {
                if let Some(Value::Array(_)) = map.get(key) {
                    return facts_from_json(&map[key]);
                }
            }
            // Grouped: cluster name → list of fact objects.
            for (key, val) in map {
                let cluster = match Cluster::parse_loose(key) {
                    Some(c) => c,
                    None => continue,
                };
                if let Value::Array(items) = val {
                    for item in items {
                        if let Some(line) = fact_from_object(item, Some(cluster.name())) {
                            out.push(line);
                        }
                    }
                }
            }
        }
        _ => {}
    }

    out
}

/// Salvage fact objects from unparseable (truncated) JSON text.
pub fn facts_from_truncated_json(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in FACT_OBJ_RE.captures_iter(text) {
        let cluster = caps["cluster"].trim();
        let keyword = caps["keyword"].trim();
        let v_tok = caps["value"].trim();
        let value = if v_tok.starts_with('"') && v_tok.ends_with('"') && v_tok.len() >= 2 {
            &v_tok[1..v_tok.len() - 1]
        } else {
            v_tok
        };
        let value = value.trim().trim_start_matches('$').trim();
        let timestamp = caps["timestamp"].trim();
        if !cluster.is_empty() && !keyword.is_empty() && !value.is_empty() {
            out.push(format!("{cluster}|{keyword}|{value}|{timestamp}"));
        }
    }
    out
}

/// Extract payloads of markdown code fences (``` or ```json).
pub fn fenced_payloads(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_fence = false;
    let mut buf = String::new();
    for ln in text.lines() {
        let t = ln.trim();
        if t.starts_with("```") {
            if in_fence {
                out.push(std::mem::take(&mut buf));
            }
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            buf.push_str(ln);
            buf.push('\n');
        }
    }
    if in_fence && !buf.trim().is_empty() {
        // Unclosed fence: keep what we have, truncation is common.
        out.push(buf);
    }
    out
}
