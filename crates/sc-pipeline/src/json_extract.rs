//! Best-effort extraction of the first JSON object from model output.

use serde_json::Value;

/// Repair helper: escape literal newlines inside JSON strings. Some local
/// backends emit invalid JSON by placing raw `\n`/`\r` characters inside
/// quoted strings; this pass makes such JSON parseable without changing
/// meaning.
fn escape_newlines_in_json_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape = false;
    for ch in text.chars() {
        if in_string {
            if escape {
                out.push(ch);
                escape = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escape = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(ch),
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }
    out
}

/// Extract the first top-level JSON object from model output.
///
/// Returns `(object, json_text)`. On failure the object is `None` and the
/// text is a best-effort slice of what looked like JSON.
pub fn extract_first_json_object(text: &str) -> (Option<Value>, String) {
    let s = text.trim();
    if s.is_empty() {
        return (None, String::new());
    }

    let Some(start) = s.find('{') else {
        return (None, s.to_string());
    };
    let tail = &s[start..];

    // Fast path: a streaming deserializer stops at the end of the first value.
    let mut de = serde_json::Deserializer::from_str(tail).into_iter::<Value>();
    if let Some(Ok(v)) = de.next() {
        let end = de.byte_offset();
        let json_text = tail[..end].to_string();
        if v.is_object() {
            return (Some(v), json_text);
        }
        return (None, json_text);
    }

    // Repair path: slice to the last closing brace and fix raw newlines.
    if let Some(end) = tail.rfind('}') {
        let slice = &tail[..=end];
        let repaired = escape_newlines_in_json_strings(slice);
        if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
            if v.is_object() {
                return (Some(v), repaired);
            }
        }
        return (None, slice.to_string());
    }

    (None, tail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_object() {
        let (obj, text) = extract_first_json_object(r#"{"a": 1}"#);
        assert_eq!(obj, Some(json!({"a": 1})));
        assert_eq!(text, r#"{"a": 1}"#);
    }

    #[test]
    fn test_object_with_surrounding_prose() {
        let (obj, _) = extract_first_json_object("Sure! Here it is:\n{\"a\": 1}\nHope that helps.");
        assert_eq!(obj, Some(json!({"a": 1})));
    }

    #[test]
    fn test_first_object_only() {
        let (obj, text) = extract_first_json_object(r#"{"a": 1} {"b": 2}"#);
        assert_eq!(obj, Some(json!({"a": 1})));
        assert_eq!(text, r#"{"a": 1}"#);
    }

    #[test]
    fn test_raw_newline_in_string_repaired() {
        let raw = "{\"VITALS\": \"ADM: Heart Rate=88\nDC: Heart Rate=72\"}";
        let (obj, _) = extract_first_json_object(raw);
        let obj = obj.expect("repaired");
        assert_eq!(
            obj["VITALS"].as_str().unwrap(),
            "ADM: Heart Rate=88\nDC: Heart Rate=72"
        );
    }

    #[test]
    fn test_no_object() {
        let (obj, _) = extract_first_json_object("no json here");
        assert!(obj.is_none());
    }

    #[test]
    fn test_truncated_object() {
        let (obj, text) = extract_first_json_object(r#"{"a": {"b": 1}"#);
        // Unclosed outer object: the inner closing brace slice fails to parse.
        assert!(obj.is_none());
        assert!(!text.is_empty());
    }
}
