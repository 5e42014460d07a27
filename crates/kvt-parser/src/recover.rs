//! Line-level recovery of partial KVT4 lines.

use sc_core::{cluster_for_keyword, Cluster};

/// Result of attempting to recover a single output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRecovery {
    /// A 4-field candidate line (possibly repaired).
    Line(String),
    /// The line carries no fact (prose, header, terminator).
    Drop,
}

const MAX_FIELD_CHARS: usize = 120;
const MAX_KEYWORD_WORDS: usize = 8;

/// Repair and sanity-check one raw output line.
///
/// Handles:
/// - plain 4-field lines
/// - 5-field lines with a literal leading `CLUSTER|` token
/// - 3-field lines missing either the cluster (known keyword) or the
///   timestamp (leading cluster token, filled with the cluster default)
pub fn recover_line(raw: &str) -> LineRecovery {
    let ln = raw.trim();
    if ln.is_empty() || ln.eq_ignore_ascii_case("end") {
        return LineRecovery::Drop;
    }

    let sep_count = ln.matches('|').count();
    let parts: Vec<String> = ln.split('|').map(|p| p.trim().to_string()).collect();

    let fields: Option<[String; 4]> = match sep_count {
        3 => Some([
            parts[0].clone(),
            parts[1].clone(),
            parts[2].clone(),
            parts[3].clone(),
        ]),
        4 => {
            // Literal "CLUSTER|DEMOGRAPHICS|Sex|female|Admission" drift:
            // the model echoed the format header token.
            let head = parts[0].to_uppercase();
            if head == "CLUSTER" || head == "CLUSTERS" {
                Some([
                    parts[1].clone(),
                    parts[2].clone(),
                    parts[3].clone(),
                    parts[4].clone(),
                ])
            } else {
                None
            }
        }
        2 => recover_three_field(&parts),
        _ => None,
    };

    let fields = match fields {
        Some(f) => f,
        None => return LineRecovery::Drop,
    };

    if !passes_sanity(&fields) {
        return LineRecovery::Drop;
    }

    LineRecovery::Line(fields.join("|"))
}

/// A 3-field line is either `<CLUSTER>|<Keyword>|<Value>` (timestamp missing)
/// or `<Keyword>|<Value>|<Timestamp>` (cluster missing).
fn recover_three_field(parts: &[String]) -> Option<[String; 4]> {
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    if let Some(cluster) = Cluster::parse_loose(&parts[0]) {
        let ts = cluster.canonical_timestamp();
        return Some([
            cluster.name().to_string(),
            parts[1].clone(),
            parts[2].clone(),
            ts.to_string(),
        ]);
    }

    if let Some(cluster) = cluster_for_keyword(&parts[0]) {
        return Some([
            cluster.name().to_string(),
            parts[0].clone(),
            parts[1].clone(),
            parts[2].clone(),
        ]);
    }

    None
}

/// Reject lines that are clearly prose or leaked instructions rather than
/// facts: empty fields, oversized fields, keyword word-spam, markdown noise.
fn passes_sanity(fields: &[String; 4]) -> bool {
    if fields.iter().any(|f| f.is_empty()) {
        return false;
    }
    if fields.iter().any(|f| f.len() > MAX_FIELD_CHARS) {
        return false;
    }
    if fields[1].split_whitespace().count() > MAX_KEYWORD_WORDS {
        return false;
    }
    if fields[0].starts_with('#') || fields[0].starts_with('-') {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> String {
        match recover_line(s) {
            LineRecovery::Line(l) => l,
            LineRecovery::Drop => panic!("expected recovery for: {s}"),
        }
    }

    #[test]
    fn test_plain_line_passes() {
        assert_eq!(line("VITALS|Heart Rate|88|Admission"), "VITALS|Heart Rate|88|Admission");
    }

    #[test]
    fn test_five_field_cluster_prefix_trimmed() {
        assert_eq!(
            line("CLUSTER|DEMOGRAPHICS|Sex|female|Admission"),
            "DEMOGRAPHICS|Sex|female|Admission"
        );
    }

    #[test]
    fn test_five_field_without_literal_prefix_dropped() {
        assert_eq!(
            recover_line("PROBLEMS|Hypertension|chronic|Past|Discharge"),
            LineRecovery::Drop
        );
    }

    #[test]
    fn test_three_field_missing_timestamp() {
        assert_eq!(line("DISPOSITION|Discharge Disposition|Home"), "DISPOSITION|Discharge Disposition|Home|Discharge");
        assert_eq!(line("UTILIZATION|ED Visits 6mo|2"), "UTILIZATION|ED Visits 6mo|2|Past");
        assert_eq!(line("VITALS|Heart Rate|88"), "VITALS|Heart Rate|88|Admission");
    }

    #[test]
    fn test_three_field_missing_cluster() {
        assert_eq!(line("Heart Rate|88|Admission"), "VITALS|Heart Rate|88|Admission");
        assert_eq!(line("BUN|17|Admission"), "LABS|BUN|17|Admission");
        assert_eq!(recover_line("Hypertension|chronic|Past"), LineRecovery::Drop);
    }

    #[test]
    fn test_prose_dropped() {
        assert_eq!(recover_line("Here are the facts:"), LineRecovery::Drop);
        assert_eq!(recover_line("END"), LineRecovery::Drop);
        let spam = format!("VITALS|{}|1|Admission", "word ".repeat(12).trim());
        assert_eq!(recover_line(&spam), LineRecovery::Drop);
    }
}
