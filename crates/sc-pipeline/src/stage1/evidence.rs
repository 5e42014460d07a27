//! Objective evidence extraction from the raw note.
//!
//! Pulls compact verbatim vitals/labs lines out of the note. Two consumers:
//! the optional prompt appendix (objective evidence placed near the prompt
//! end, where sliding-window-attention models actually look), and the
//! deterministic objective fill for the `sgr_v2_strict_cascade` profile.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

const MAX_VITALS_LINES: usize = 3;
const MAX_LABS_LINES: usize = 6;
const MAX_EVIDENCE_CHARS: usize = 240;

static LEADING_UNDERSCORES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_+\s*").expect("underscore prefix regex"));

/// Vitals-shaped payload: a BP ratio or a labeled numeric reading.
static VITALS_PAYLOAD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\b[0-9]{2,3}/[0-9]{2,3}\b|\bTemp\s*[:=]?\s*[0-9]|\bT\s*[:=]?\s*[0-9]|\bBP\s*[:=]?\s*[0-9]|\bHR\s*[:=]?\s*[0-9]|\bRR\s*[:=]?\s*[0-9]|\b(?:SaO2|SpO2)\s*[:=]?\s*[0-9]|\bO2\s*sat\s*[:=]?\s*[0-9]|\bWt\s*[:=]?\s*[0-9])",
    )
    .expect("vitals payload regex")
});

static BP_RATIO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9]{2,3}/[0-9]{2,3}\b").expect("bp ratio regex"));

static SAT_MARK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(%|\bRA\b|SpO2|SaO2)").expect("sat mark regex"));

static MEDS_LIKE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bPO\b|\bIV\b|\bBID\b|\bTID\b|\bDAILY\b|\bQHS\b)").expect("meds-like regex")
});

static LAB_KV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(WBC\s*[-:]|HGB\s*[-:]|HCT\s*[-:]|PLT(?:\s*(?:COUNT|CT))?\s*[-:]|GLUCOSE\s*[-:]|UREA\s*N\s*[-:]|UREAN\s*[-:]|CREAT\s*[-:]|CREATININE\s*[-:]|SODIUM\s*[-:]|POTASSIUM\s*[-:]|TOTAL\s*CO2\s*[-:]|HCO3\s*[-:]|BICARB\s*[-:]|CO2\s*[-:]|\bNa\s*[-:]|\bK\s*[-:])",
    )
    .expect("lab kv regex")
});

const LAB_TOKENS: [&str; 20] = [
    "WBC",
    "HGB",
    "HCT",
    "PLT",
    "HEMOGLOBIN",
    "HEMATOCRIT",
    "PLATELET",
    "SODIUM",
    "POTASSIUM",
    "GLUCOSE",
    "BUN",
    "UREA N",
    "UREAN",
    "CREAT",
    "CREATININE",
    "TOTAL CO2",
    "CO2",
    "HCO3",
    "BICARB",
    "BICARBONATE",
];

/// One-line, pipe-free evidence with placeholder prefixes removed.
pub fn sanitize_evidence_line(line: &str) -> String {
    let t = line.replace('|', " ");
    let t = t.split_whitespace().collect::<Vec<_>>().join(" ");
    let t = LEADING_UNDERSCORES_RE.replace(&t, "").to_string();
    let mut t = t.replace("___", "not stated");
    if t.len() > MAX_EVIDENCE_CHARS {
        let mut cut = MAX_EVIDENCE_CHARS;
        while cut > 0 && !t.is_char_boundary(cut) {
            cut -= 1;
        }
        t.truncate(cut);
        t = t.trim_end().to_string();
    }
    if t.is_empty() {
        "not stated".to_string()
    } else {
        t
    }
}

/// Extract compact objective evidence lines (vitals + labs) from the note.
pub fn extract_objective_lines(note_text: &str) -> (Vec<String>, Vec<String>) {
    let lines: Vec<&str> = note_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut vitals: Vec<String> = Vec::new();
    let mut labs: Vec<String> = Vec::new();

    for (idx, ln) in lines.iter().enumerate() {
        let up = ln.to_uppercase();
        if !up.contains("VITALS:") && !up.contains("VITAL SIGNS") {
            continue;
        }
        let t0 = sanitize_evidence_line(ln);
        if !vitals.contains(&t0) {
            vitals.push(t0);
        }
        // Header-only line: vitals frequently wrap, pull continuation lines.
        if !VITALS_PAYLOAD_RE.is_match(ln) {
            for ln2 in lines.iter().skip(idx + 1).take(5) {
                if vitals.len() >= MAX_VITALS_LINES {
                    break;
                }
                if !ln2.chars().any(|c| c.is_ascii_digit()) {
                    continue;
                }
                let t1 = sanitize_evidence_line(ln2);
                if !vitals.contains(&t1) {
                    vitals.push(t1);
                }
            }
        }
        if vitals.len() >= MAX_VITALS_LINES {
            break;
        }
    }

    // Fallback: unlabeled exam-section vitals like "169/68 55 17 99 99% RA".
    if vitals.is_empty() {
        for ln in &lines {
            if vitals.len() >= MAX_VITALS_LINES {
                break;
            }
            if !BP_RATIO_RE.is_match(ln) || !SAT_MARK_RE.is_match(ln) {
                continue;
            }
            let t = sanitize_evidence_line(ln);
            if !vitals.contains(&t) {
                vitals.push(t);
            }
        }
    }

    // Labs: compact hyphenated key-value sequences, meds lines excluded.
    for ln in &lines {
        if labs.len() >= MAX_LABS_LINES {
            break;
        }
        let up = ln.to_uppercase();
        if !LAB_TOKENS.iter().any(|tok| up.contains(tok)) {
            continue;
        }
        if !ln.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }
        if MEDS_LIKE_RE.is_match(ln) {
            continue;
        }
        if !LAB_KV_RE.is_match(ln) {
            continue;
        }
        let t = sanitize_evidence_line(ln);
        if !labs.contains(&t) {
            labs.push(t);
        }
    }

    (vitals, labs)
}

/// Render the evidence appendix appended near the end of the user prompt.
pub fn objective_appendix(vitals: &[String], labs: &[String]) -> String {
    if vitals.is_empty() && labs.is_empty() {
        return String::new();
    }
    let mut out: Vec<&str> = vec!["OBJECTIVE EVIDENCE EXCERPT (verbatim):"];
    if !vitals.is_empty() {
        out.push("VITALS:");
        out.extend(vitals.iter().map(String::as_str));
    }
    if !labs.is_empty() {
        out.push("LABS:");
        out.extend(labs.iter().map(String::as_str));
    }
    out.join("\n").trim().to_string()
}

// ---------------------------------------------------------------------------
// Numeric parsing of evidence lines (strict-cascade fill)
// ---------------------------------------------------------------------------

static VITALS_INLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bvitals:\s*(?P<temp>[0-9]+(?:\.[0-9]+)?)\s+(?P<hr>[0-9]+(?:\.[0-9]+)?)\s+(?P<sbp>[0-9]+(?:\.[0-9]+)?)/(?P<dbp>[0-9]+(?:\.[0-9]+)?)\s+(?P<rr>[0-9]+(?:\.[0-9]+)?)\s+(?P<spo2>[0-9]+(?:\.[0-9]+)?)",
    )
    .expect("inline vitals regex")
});

static LABELED_BP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBP\s*[:=]?\s*(?P<sbp>[0-9]{2,3})/(?P<dbp>[0-9]{2,3})\b").expect("bp regex")
});
static UNLABELED_BP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?P<sbp>[0-9]{2,3})/(?P<dbp>[0-9]{2,3})\b").expect("bp2 regex"));
static TEMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bT(?:emp(?:erature)?)?\s*[:=]?\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\b")
        .expect("temp regex")
});
static HR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:HR|P|Pulse|Heart Rate)\s*[:=]?\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\b")
        .expect("hr regex")
});
static RR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:RR|Resp(?:iratory)?\s*Rate|R)\s*[:=]?\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\b")
        .expect("rr regex")
});
static SPO2_VAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:SaO2|SpO2|O2\s*sat)\s*[:=]?\s*(?P<v>[0-9]+(?:\.[0-9]+)?)\b")
        .expect("spo2 regex")
});
static WEIGHT_KG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?P<v>[0-9]+(?:\.[0-9]+)?)\s*kg\b").expect("weight regex")
});
static BARE_NUM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<v>[0-9]+(?:\.[0-9]+)?)").expect("bare num regex")
});

/// Parse vitals values out of evidence lines. Keys are the snake-case field
/// names used by the strict-cascade schema.
pub fn parse_vitals_from_lines(vitals_lines: &[String]) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();

    for ln in vitals_lines {
        if let Some(caps) = VITALS_INLINE_RE.captures(ln) {
            out.insert("temperature".into(), caps["temp"].to_string());
            out.insert("heart_rate".into(), caps["hr"].to_string());
            out.insert("systolic_bp".into(), caps["sbp"].to_string());
            out.insert("diastolic_bp".into(), caps["dbp"].to_string());
            out.insert("respiratory_rate".into(), caps["rr"].to_string());
            out.insert("spo2".into(), caps["spo2"].to_string());
            return out;
        }
    }

    let text = vitals_lines.join(" ");
    if text.trim().is_empty() {
        return out;
    }

    // Labeled/compact format: "T: 98.4 P: 54 R: 16 BP: 141/40 SaO2: 94% on RA".
    let bp = LABELED_BP_RE
        .captures(&text)
        .or_else(|| UNLABELED_BP_RE.captures(&text));
    if let Some(caps) = bp {
        out.insert("systolic_bp".into(), caps["sbp"].to_string());
        out.insert("diastolic_bp".into(), caps["dbp"].to_string());
    }
    if let Some(caps) = TEMP_RE.captures(&text) {
        out.insert("temperature".into(), caps["v"].to_string());
    }
    if let Some(caps) = HR_RE.captures(&text) {
        out.insert("heart_rate".into(), caps["v"].to_string());
    }
    if let Some(caps) = RR_RE.captures(&text) {
        out.insert("respiratory_rate".into(), caps["v"].to_string());
    }
    if let Some(caps) = SPO2_VAL_RE.captures(&text) {
        out.insert("spo2".into(), caps["v"].to_string());
    }
    if let Some(caps) = WEIGHT_KG_RE.captures(&text) {
        out.insert("weight".into(), caps["v"].to_string());
    }

    // Fallback for the unlabeled compact exam format "169/68 55 17 99 99% RA":
    // positional numbers after the BP ratio.
    if out.contains_key("systolic_bp")
        && (!out.contains_key("heart_rate")
            || !out.contains_key("respiratory_rate")
            || !out.contains_key("temperature")
            || !out.contains_key("spo2"))
    {
        for ln in vitals_lines {
            if !UNLABELED_BP_RE.is_match(ln) {
                continue;
            }
            let rest = UNLABELED_BP_RE.replace_all(ln, " ");
            // Skip digits glued to letters so the 2 in "SaO2" is not a value.
            let nums: Vec<String> = BARE_NUM_RE
                .find_iter(&rest)
                .filter(|m| {
                    let before = rest[..m.start()].chars().next_back();
                    let after = rest[m.end()..].chars().next();
                    !before.map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
                        && !after.map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
                })
                .map(|m| m.as_str().to_string())
                .collect();
            if nums.len() < 4 {
                continue;
            }
            out.entry("heart_rate".into()).or_insert_with(|| nums[0].clone());
            out.entry("respiratory_rate".into())
                .or_insert_with(|| nums[1].clone());
            out.entry("temperature".into()).or_insert_with(|| nums[2].clone());
            out.entry("spo2".into())
                .or_insert_with(|| nums[nums.len() - 1].clone());
            break;
        }
    }

    out
}

fn lab_pattern(aliases: &[&str]) -> Regex {
    let alts = aliases
        .iter()
        .map(|a| regex::escape(a).replace("\\ ", r"\s*"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?i)\b(?:{alts})(?:\s*(?:COUNT|CT))?\s*[-:=]\s*(?P<v>[0-9]+(?:\.[0-9]+)?)(?:[*#])?\b"
    ))
    .expect("lab pattern")
}

static LAB_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("wbc", lab_pattern(&["WBC"])),
        ("hemoglobin", lab_pattern(&["HGB", "HEMOGLOBIN"])),
        ("hematocrit", lab_pattern(&["HCT", "HEMATOCRIT"])),
        ("platelet", lab_pattern(&["PLT", "PLATELET"])),
        ("sodium", lab_pattern(&["SODIUM", "Na"])),
        ("potassium", lab_pattern(&["POTASSIUM", "K"])),
        ("creatinine", lab_pattern(&["CREATININE", "CREAT"])),
        ("bun", lab_pattern(&["BUN", "UREA N", "UREAN"])),
        ("glucose", lab_pattern(&["GLUCOSE"])),
        ("bicarbonate", lab_pattern(&["TOTAL CO2", "HCO3", "BICARBONATE", "BICARB", "CO2"])),
    ]
});

/// Parse lab values out of evidence lines; urine panels are excluded so a
/// `URINE WBC-1` row never shadows the blood count.
pub fn parse_labs_from_lines(labs_lines: &[String]) -> BTreeMap<String, String> {
    let filtered: Vec<&String> = labs_lines
        .iter()
        .filter(|ln| !ln.to_uppercase().contains("URINE"))
        .collect();
    let text = filtered
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = BTreeMap::new();
    if text.trim().is_empty() {
        return out;
    }
    for (key, re) in LAB_PATTERNS.iter() {
        if let Some(caps) = re.captures(&text) {
            out.insert(key.to_string(), caps["v"].to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Strict-cascade deterministic fill
// ---------------------------------------------------------------------------

fn is_not_stated(v: Option<&Value>) -> bool {
    match v {
        None => true,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("not stated"),
        Some(Value::Null) => true,
        _ => false,
    }
}

fn fill_block(
    block: &mut Value,
    evidence_lines: &[String],
    n_evidence: usize,
    parsed: &BTreeMap<String, String>,
) {
    let Some(map) = block.as_object_mut() else { return };

    for i in 1..=n_evidence {
        let key = format!("evidence_line{i}");
        if is_not_stated(map.get(&key)) {
            if let Some(line) = evidence_lines.get(i - 1) {
                map.insert(key, Value::String(line.clone()));
            }
        }
    }

    if let Some(Value::Object(adm)) = map.get_mut("admission") {
        for (k, v) in parsed {
            if adm.contains_key(k) && is_not_stated(adm.get(k)) {
                adm.insert(k.clone(), Value::String(v.clone()));
            }
        }
    }
}

/// Deterministic objective fill for `sgr_v2_strict_cascade`: when the model
/// leaves evidence slots or admission values at `not stated` but evidence is
/// present, fill them from the extracted lines.
pub fn fill_strict_cascade_objective(
    obj: &mut Value,
    vitals_lines: &[String],
    labs_lines: &[String],
) {
    let vitals_parsed = parse_vitals_from_lines(vitals_lines);
    let labs_parsed = parse_labs_from_lines(labs_lines);
    if let Some(vitals) = obj.get_mut("VITALS") {
        fill_block(vitals, vitals_lines, 3, &vitals_parsed);
    }
    if let Some(labs) = obj.get_mut("LABS") {
        fill_block(labs, labs_lines, 6, &labs_parsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evidence_line_hygiene() {
        assert_eq!(
            sanitize_evidence_line("___ Vitals: T 98.4 | BP 141/40"),
            "Vitals: T 98.4 BP 141/40"
        );
        let long = "x".repeat(500);
        assert!(sanitize_evidence_line(&long).len() <= 240);
    }

    #[test]
    fn test_extract_labeled_vitals() {
        let note = "HPI: ...\nVitals: T: 98.4 P: 54 R: 16 BP: 141/40 SaO2: 94% on RA\nLabs pending";
        let (vitals, _) = extract_objective_lines(note);
        assert_eq!(vitals.len(), 1);
        assert!(vitals[0].contains("141/40"));
    }

    #[test]
    fn test_extract_unlabeled_vitals_fallback() {
        let note = "Admission exam:\n169/68 55 17 99 99% RA\nGeneral: well appearing";
        let (vitals, _) = extract_objective_lines(note);
        assert_eq!(vitals.len(), 1);
        assert!(vitals[0].contains("169/68"));
    }

    #[test]
    fn test_extract_labs_excludes_meds() {
        let note = "\
WBC-7.7 HGB-11.0 HCT-34.6 PLT-220
Losartan Potassium 100 mg PO DAILY
GLUCOSE-129 UREA N-17 CREAT-0.9 SODIUM-141 POTASSIUM-4.3 TOTAL CO2-28";
        let (_, labs) = extract_objective_lines(note);
        assert_eq!(labs.len(), 2);
        assert!(labs.iter().all(|l| !l.contains("Losartan")));
    }

    #[test]
    fn test_parse_vitals_labeled() {
        let lines = vec!["Vitals: T: 98.4 P: 54 R: 16 BP: 141/40 SaO2: 94% on RA".to_string()];
        let parsed = parse_vitals_from_lines(&lines);
        assert_eq!(parsed["systolic_bp"], "141");
        assert_eq!(parsed["diastolic_bp"], "40");
        assert_eq!(parsed["heart_rate"], "54");
        assert_eq!(parsed["spo2"], "94");
    }

    #[test]
    fn test_parse_labs_hyphenated() {
        let lines = vec!["WBC-7.7 HGB-11.0* HCT-34.6 GLUCOSE-129 UREA N-17 TOTAL CO2-28".to_string()];
        let parsed = parse_labs_from_lines(&lines);
        assert_eq!(parsed["wbc"], "7.7");
        assert_eq!(parsed["hemoglobin"], "11.0");
        assert_eq!(parsed["bun"], "17");
        assert_eq!(parsed["bicarbonate"], "28");
    }

    #[test]
    fn test_parse_labs_skips_urine() {
        let lines = vec!["URINE WBC-1".to_string()];
        assert!(parse_labs_from_lines(&lines).is_empty());
    }

    #[test]
    fn test_strict_cascade_fill() {
        let mut obj = json!({
            "VITALS": {
                "evidence_line1": "not stated",
                "evidence_line2": "not stated",
                "evidence_line3": "not stated",
                "admission": {"heart_rate": "not stated", "systolic_bp": "not stated"}
            }
        });
        let vitals = vec!["Vitals: T: 98.4 P: 54 R: 16 BP: 141/40 SaO2: 94%".to_string()];
        fill_strict_cascade_objective(&mut obj, &vitals, &[]);
        assert_eq!(obj["VITALS"]["evidence_line1"], vitals[0]);
        assert_eq!(obj["VITALS"]["admission"]["heart_rate"], "54");
        assert_eq!(obj["VITALS"]["admission"]["systolic_bp"], "141");
    }

    #[test]
    fn test_appendix_shape() {
        let appendix = objective_appendix(
            &["Vitals: HR 88".to_string()],
            &["WBC-7.7".to_string()],
        );
        assert!(appendix.starts_with("OBJECTIVE EVIDENCE EXCERPT (verbatim):"));
        assert!(appendix.contains("VITALS:\nVitals: HR 88"));
        assert!(appendix.contains("LABS:\nWBC-7.7"));
    }
}
