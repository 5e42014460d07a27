//! Top-level extraction of KVT4 candidate lines from raw model output.

use crate::json_forms::{facts_from_json, facts_from_truncated_json, fenced_payloads};
use crate::narrative::{facts_from_heading_context, facts_from_narrative};
use crate::recover::{recover_line, LineRecovery};
use std::collections::HashSet;

/// Extract candidate KVT4 lines from model output in any supported shape.
///
/// Order of attempts, cheapest first:
/// 1. whole-output JSON (array, `{"facts": …}`, grouped)
/// 2. fenced code-block payloads, parsed or salvaged as truncated JSON
/// 3. plain line scan with 3-/5-field recovery
/// 4. narrative label blocks and heading-context items when the line scan
///    found nothing
/// 5. truncated-JSON salvage as the last resort
///
/// Duplicates are removed preserving first-seen order.
pub fn extract_fact_lines(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<String> = Vec::new();

    if let Ok(root) = serde_json::from_str::<serde_json::Value>(trimmed) {
        candidates.extend(facts_from_json(&root));
    }

    if candidates.is_empty() {
        for payload in fenced_payloads(trimmed) {
            match serde_json::from_str::<serde_json::Value>(payload.trim()) {
                Ok(root) => candidates.extend(facts_from_json(&root)),
                Err(_) => candidates.extend(facts_from_truncated_json(&payload)),
            }
        }
    }

    if candidates.is_empty() {
        for raw in trimmed.lines() {
            if let LineRecovery::Line(line) = recover_line(raw) {
                candidates.push(line);
            }
        }
    }

    if candidates.is_empty() {
        candidates.extend(facts_from_narrative(trimmed));
    }
    if candidates.is_empty() {
        candidates.extend(facts_from_heading_context(trimmed));
    }
    if candidates.is_empty() {
        candidates.extend(facts_from_truncated_json(trimmed));
    }

    // Re-validate recovered candidates and dedup preserving first-seen order.
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    for cand in candidates {
        let line = match recover_line(&cand) {
            LineRecovery::Line(l) => l,
            LineRecovery::Drop => continue,
        };
        if seen.insert(line.clone()) {
            out.push(line);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_lines() {
        let text = "DEMOGRAPHICS|Sex|female|Admission\nVITALS|Heart Rate|88|Admission\nEND";
        assert_eq!(
            extract_fact_lines(text),
            vec![
                "DEMOGRAPHICS|Sex|female|Admission",
                "VITALS|Heart Rate|88|Admission"
            ]
        );
    }

    #[test]
    fn test_fenced_json_array() {
        let text = "Here you go:\n```json\n[{\"cluster\": \"LABS\", \"keyword\": \"WBC\", \"value\": \"7.7\", \"timestamp\": \"Admission\"}]\n```";
        assert_eq!(extract_fact_lines(text), vec!["LABS|WBC|7.7|Admission"]);
    }

    #[test]
    fn test_bare_json_grouped() {
        let text = r#"{"VITALS": [{"K": "SpO2", "V": "94", "T": "Discharge"}]}"#;
        assert_eq!(extract_fact_lines(text), vec!["VITALS|SpO2|94|Discharge"]);
    }

    #[test]
    fn test_truncated_json_salvage() {
        let text = r#"{"facts": [{"cluster": "VITALS", "keyword": "Heart Rate", "value": "120", "timestamp": "Admission"}, {"cluster": "VIT"#;
        assert_eq!(extract_fact_lines(text), vec!["VITALS|Heart Rate|120|Admission"]);
    }

    #[test]
    fn test_narrative_fallback() {
        let text = "The patient facts are:\n**Cluster:** SYMPTOMS\n**Keyword:** Dizziness\n**Value:** yes\n**Timestamp:** Admission";
        assert_eq!(extract_fact_lines(text), vec!["SYMPTOMS|Dizziness|yes|Admission"]);
    }

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let text = "LABS|WBC|7.7|Admission\nVITALS|Heart Rate|88|Admission\nLABS|WBC|7.7|Admission";
        assert_eq!(
            extract_fact_lines(text),
            vec!["LABS|WBC|7.7|Admission", "VITALS|Heart Rate|88|Admission"]
        );
    }

    #[test]
    fn test_mixed_recovery_in_line_scan() {
        let text = "CLUSTER|DEMOGRAPHICS|Sex|male|Admission\nHeart Rate|92|Admission\nsome prose here";
        assert_eq!(
            extract_fact_lines(text),
            vec!["DEMOGRAPHICS|Sex|male|Admission", "VITALS|Heart Rate|92|Admission"]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(extract_fact_lines("").is_empty());
        assert!(extract_fact_lines("  \n \n").is_empty());
    }

    proptest! {
        // Serialized well-formed facts always survive extraction unchanged.
        #[test]
        fn prop_wellformed_lines_roundtrip(
            value in "[0-9]{1,3}",
            ts in prop::sample::select(vec!["Past", "Admission", "Discharge", "Unknown"]),
        ) {
            let line = format!("VITALS|Heart Rate|{value}|{ts}");
            let out = extract_fact_lines(&line);
            prop_assert_eq!(out, vec![line]);
        }
    }
}
