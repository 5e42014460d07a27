//! Fixed-shape Markdown projection of the Stage-1 digest.
//!
//! The Markdown is the ONLY input Stage 2 sees. The shape is deliberately
//! rigid — one `## CLUSTER` header per cluster, canonical key order, both
//! `ADM:` and `DC:` lines always present for VITALS/LABS — because small
//! models parse a fixed shape far more reliably than free text.

use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::{
    normalize_sparse_key, Cluster, ClusterValue, Digest, ObjectiveBlock, NOT_STATED,
};

static NOT_STATED_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bnot stated\b").expect("not stated regex"));
static NA_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bn/?a\b").expect("na regex"));
static UNKNOWN_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bunknown\b").expect("unknown regex"));

/// Clean one PROBLEMS/SYMPTOMS item: single line, pipe-free, placeholder
/// leakage removed.
pub fn semantic_item_clean(item: &str) -> String {
    let mut s = item.replace(['\n', '\r'], " ");
    s = s.replace('|', " ").replace("___", NOT_STATED);
    s = NOT_STATED_WORD_RE.replace_all(&s, " ").to_string();
    s = NA_WORD_RE.replace_all(&s, " ").to_string();
    s = UNKNOWN_WORD_RE.replace_all(&s, " ").to_string();
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let s = s
        .trim_matches(|c: char| " ,;:-()[]{}".contains(c))
        .to_string();
    if sc_core::is_placeholder(&s) {
        return String::new();
    }
    s
}

fn join_items(items: &[String], max_items: usize) -> String {
    let mut cleaned: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for it in items {
        let s = semantic_item_clean(it);
        if s.is_empty() {
            continue;
        }
        let key = normalize_sparse_key(&s);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        cleaned.push(s);
        if cleaned.len() >= max_items {
            break;
        }
    }
    if cleaned.is_empty() {
        NOT_STATED.to_string()
    } else {
        cleaned.join(", ")
    }
}

fn norm_text(value: &str) -> String {
    let s = value.replace('|', " ");
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.replace("\\r\\n", "\n").replace("\\n", "\n").replace("\\r", "\n");
    s.replace("Sex=F", "Sex=female").replace("Sex=M", "Sex=male")
}

fn text_lines(value: &str) -> Vec<String> {
    norm_text(value)
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.trim().is_empty())
        .collect()
}

/// Fixed-shape objective line: every canonical key present, filled or
/// `not stated`. Candidate source keys cover both display ("Heart Rate")
/// and snake_case ("heart_rate") spellings.
fn objective_line(
    block: &std::collections::BTreeMap<String, String>,
    fields: &[&str],
) -> String {
    let mut parts: Vec<String> = Vec::new();
    for display in fields {
        let snake = normalize_sparse_key(display).replace(' ', "_");
        let raw = block
            .get(*display)
            .or_else(|| block.get(&snake))
            .map(String::as_str)
            .unwrap_or("")
            .trim();
        let val = if raw.is_empty() || raw.eq_ignore_ascii_case(NOT_STATED) {
            NOT_STATED
        } else {
            raw
        };
        parts.push(format!("{display}={val}"));
    }
    parts.join("; ")
}

fn render_objective(block: &ObjectiveBlock, fields: &[&str]) -> Vec<String> {
    vec![
        format!("ADM: {}", objective_line(&block.admission, fields)),
        format!("DC: {}", objective_line(&block.discharge, fields)),
    ]
}

fn render_cluster(digest: &Digest, cluster: Cluster) -> Vec<String> {
    let value = digest.get(cluster);
    match (cluster, value) {
        (Cluster::Problems, ClusterValue::Problems(p)) => vec![
            format!("PMH/Comorbidities={}", join_items(&p.pmh_comorbidities, 20)),
            format!("Discharge Dx={}", join_items(&p.discharge_dx, 10)),
            format!("Complications={}", join_items(&p.complications, 10)),
            format!("Working Dx={}", join_items(&p.working_dx, 10)),
        ],
        (Cluster::Symptoms, ClusterValue::Symptoms(s)) => vec![
            // Conservative caps for small-model stability.
            format!("ADM symptoms={}", join_items(&s.admission, 3)),
            format!("DC symptoms={}", join_items(&s.discharge, 1)),
        ],
        (Cluster::Demographics, ClusterValue::Objective(o)) => {
            let sex = o
                .admission
                .get("sex")
                .or_else(|| o.admission.get("Sex"))
                .cloned()
                .unwrap_or_else(|| NOT_STATED.to_string());
            let age = o
                .admission
                .get("age")
                .or_else(|| o.admission.get("Age"))
                .cloned()
                .unwrap_or_else(|| NOT_STATED.to_string());
            vec![format!("Sex={sex}"), format!("Age={age}")]
        }
        (Cluster::Vitals, ClusterValue::Objective(o)) => {
            render_objective(o, &sc_core::VITALS_ORDER)
        }
        (Cluster::Labs, ClusterValue::Objective(o)) => render_objective(o, &sc_core::LABS_ORDER),
        (_, v) => {
            let lines = text_lines(&v.as_text());
            if lines.is_empty() {
                vec![NOT_STATED.to_string()]
            } else {
                lines
            }
        }
    }
}

/// Project a normalized digest to the fixed-shape Markdown summary.
pub fn digest_to_markdown(digest: &Digest) -> String {
    let mut out: Vec<String> = Vec::new();
    for cluster in Cluster::ALL {
        out.push(format!("## {}", cluster.name()));
        let lines = render_cluster(digest, cluster);
        if lines.is_empty() {
            out.push(NOT_STATED.to_string());
        } else {
            out.extend(lines);
        }
        out.push(String::new());
    }
    let mut text = out.join("\n").trim_end().to_string();
    text.push('\n');
    text
}

/// Keep only the selected `## CLUSTER` sections.
pub fn filter_markdown_sections(md: &str, allowed: &[Cluster]) -> String {
    let want: Vec<&str> = allowed.iter().map(|c| c.name()).collect();
    let mut out: Vec<&str> = Vec::new();
    let mut keep = false;
    for ln in md.lines() {
        if let Some(name) = ln.strip_prefix("## ") {
            keep = want.contains(&name.trim().to_uppercase().as_str());
        }
        if keep {
            out.push(ln.trim_end());
        }
    }
    let mut text = out.join("\n").trim_end().to_string();
    text.push('\n');
    text
}

/// Compact the Markdown before Stage-2 ingestion: remove `=not stated`
/// pairs, bare `not stated` lines, and section headers left empty. Saves
/// tokens and keeps late sections from being truncated away.
pub fn compact_markdown(md: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for ln in md.lines() {
        let stripped = ln.trim();

        if stripped.eq_ignore_ascii_case(NOT_STATED) {
            continue;
        }
        if stripped.starts_with("## ") {
            out.push(ln.trim_end().to_string());
            continue;
        }
        if stripped.contains(';') && stripped.contains('=') {
            let (prefix, body) = match stripped.split_once(':') {
                Some((p, b)) if matches!(p.trim().to_uppercase().as_str(), "ADM" | "DC") => {
                    (format!("{}: ", p.trim().to_uppercase()), b.trim())
                }
                _ => (String::new(), stripped),
            };
            let kept: Vec<&str> = body
                .split(';')
                .map(str::trim)
                .filter(|p| !p.to_lowercase().ends_with("=not stated"))
                .filter(|p| !p.is_empty())
                .collect();
            if !kept.is_empty() {
                out.push(format!("{prefix}{}", kept.join("; ")));
            }
            continue;
        }
        if let Some((_, v)) = stripped.split_once('=') {
            if v.trim().eq_ignore_ascii_case(NOT_STATED) {
                continue;
            }
        }
        out.push(ln.trim_end().to_string());
    }

    // Second pass: drop headers whose section lost every line.
    let mut final_lines: Vec<String> = Vec::new();
    for (i, ln) in out.iter().enumerate() {
        if ln.trim().starts_with("## ") {
            let mut has_content = false;
            for next in &out[i + 1..] {
                if next.trim().starts_with("## ") {
                    break;
                }
                if !next.trim().is_empty() {
                    has_content = true;
                    break;
                }
            }
            if !has_content {
                continue;
            }
        }
        final_lines.push(ln.clone());
    }

    let mut text = final_lines.join("\n").trim_end().to_string();
    text.push('\n');
    text
}

/// Non-header lines of one `## SECTION`.
pub fn section_lines(md: &str, section: &str) -> Vec<String> {
    let target = section.trim().to_uppercase();
    let mut current = String::new();
    let mut lines = Vec::new();
    for raw in md.lines() {
        let stripped = raw.trim();
        if let Some(name) = stripped.strip_prefix("## ") {
            current = name.trim().to_uppercase();
            continue;
        }
        if current == target && !stripped.is_empty() {
            lines.push(stripped.to_string());
        }
    }
    lines
}

const UTILIZATION_PLACEHOLDERS: [&str; 6] = ["", "not stated", "none", "unknown", "n/a", "___"];

/// Does the UTILIZATION section carry any non-placeholder evidence?
pub fn utilization_has_evidence(md: &str) -> bool {
    for ln in section_lines(md, "UTILIZATION") {
        for token in ln.split(';') {
            let t = token.trim();
            if t.is_empty() {
                continue;
            }
            let value = t.split_once('=').map(|(_, v)| v.trim()).unwrap_or(t);
            if !UTILIZATION_PLACEHOLDERS.contains(&value.to_lowercase().as_str()) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_core::{ProblemsBlock, SymptomsBlock};

    fn sample_digest() -> Digest {
        let mut d = Digest::default();
        d.demographics = ClusterValue::Text("Sex=female\nAge=72".into());
        d.vitals = ClusterValue::Text(
            "ADM: Heart Rate=88; Systolic BP=140; Diastolic BP=90".into(),
        );
        d.problems = ClusterValue::Problems(ProblemsBlock {
            pmh_comorbidities: vec!["Hypertension".into(), "Diabetes".into()],
            discharge_dx: vec!["viral gastroenteritis".into()],
            complications: vec![],
            working_dx: vec![],
        });
        d.symptoms = ClusterValue::Symptoms(SymptomsBlock {
            admission: vec![
                "Dizziness".into(),
                "Nausea".into(),
                "Vomiting".into(),
                "Diarrhea".into(),
            ],
            discharge: vec![],
        });
        d
    }

    #[test]
    fn test_markdown_shape() {
        let md = digest_to_markdown(&sample_digest());
        for cluster in Cluster::ALL {
            assert!(md.contains(&format!("## {}", cluster.name())), "{md}");
        }
        assert!(md.contains("PMH/Comorbidities=Hypertension, Diabetes"));
        assert!(md.contains("Discharge Dx=viral gastroenteritis"));
        assert!(md.contains("Complications=not stated"));
        // Admission symptoms capped at 3.
        assert!(md.contains("ADM symptoms=Dizziness, Nausea, Vomiting"));
        assert!(!md.contains("Diarrhea"));
        assert!(md.contains("DC symptoms=not stated"));
    }

    #[test]
    fn test_objective_block_renders_all_keys() {
        let mut d = Digest::default();
        let mut block = ObjectiveBlock::default();
        block
            .admission
            .insert("heart_rate".to_string(), "88".to_string());
        d.vitals = ClusterValue::Objective(block);
        let md = digest_to_markdown(&d);
        assert!(md.contains("ADM: Heart Rate=88; Systolic BP=not stated"));
        assert!(md.contains("DC: Heart Rate=not stated"));
    }

    #[test]
    fn test_filter_sections() {
        let md = digest_to_markdown(&sample_digest());
        let filtered = filter_markdown_sections(
            &md,
            &[Cluster::Demographics, Cluster::Vitals, Cluster::Labs],
        );
        assert!(filtered.contains("## VITALS"));
        assert!(!filtered.contains("## PROBLEMS"));
    }

    #[test]
    fn test_compact_drops_not_stated() {
        let md = "## VITALS\nADM: Heart Rate=88; Systolic BP=not stated\n\n## LABS\nnot stated\n\n## DISPOSITION\nDischarge Disposition=Home\n";
        let compact = compact_markdown(md);
        assert!(compact.contains("ADM: Heart Rate=88"));
        assert!(!compact.contains("Systolic BP"));
        assert!(!compact.contains("## LABS"));
        assert!(compact.contains("Discharge Disposition=Home"));
    }

    #[test]
    fn test_semantic_item_clean() {
        assert_eq!(semantic_item_clean("  Hypertension , "), "Hypertension");
        assert_eq!(semantic_item_clean("___"), "");
        assert_eq!(semantic_item_clean("unknown"), "");
        assert_eq!(semantic_item_clean("CHF | chronic"), "CHF chronic");
    }

    #[test]
    fn test_utilization_evidence_gate_helper() {
        let with = "## UTILIZATION\nPrior Admissions 12mo=2\n";
        let without = "## UTILIZATION\nPrior Admissions 12mo=not stated\n";
        assert!(utilization_has_evidence(with));
        assert!(!utilization_has_evidence(without));
    }
}
