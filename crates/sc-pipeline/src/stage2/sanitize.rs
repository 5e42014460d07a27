//! Cluster-aware sanitation of the Stage-2 fact stream.
//!
//! Each step takes and returns a list of KVT4 lines. The steps are gated by
//! [`Stage2Policy`] flags; `sanitize_stage2` wires them in pipeline order.

use crate::markdown::{section_lines, utilization_has_evidence};
use crate::policy::Stage2Policy;
use crate::stage1::normalize::{extract_numeric, normalize_binary_value};
use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::{cluster_for_keyword, normalize_sparse_key, Cluster};
use sc_llm::Stage2Scope;
use std::collections::{BTreeMap, HashMap, HashSet};

static NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").expect("numeric regex"));
static BP_RATIO_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-?\d+(?:\.\d+)?)\s*/\s*(-?\d+(?:\.\d+)?)$").expect("bp ratio value regex")
});
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

const BINARY_FLAG_KEYWORDS: [&str; 7] = [
    "Anticoagulation",
    "Insulin Therapy",
    "Opioid Therapy",
    "Diuretic Therapy",
    "Any Procedure",
    "Surgery",
    "Dialysis",
];

const LEAK_SUBSTRINGS: [&str; 8] = [
    "output limits",
    "input limits",
    "hard cap",
    "canonical keywords",
    "must match exactly",
    "begin extraction",
    "one fact per line",
    "cluster|keyword|value|timestamp",
];

const LEAK_PREFIXES: [&str; 7] = ["##", "<h1", "<h2", "<h3", "<p", "<ul", "<li"];

/// Step 1: drop obvious prompt/instruction leakage lines.
pub fn drop_prompt_leakage(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut dropped = 0usize;
    for ln in lines {
        let s = ln.trim();
        if s.is_empty() {
            continue;
        }
        let sl = s.to_lowercase();
        if LEAK_PREFIXES.iter().any(|p| sl.starts_with(p))
            || LEAK_SUBSTRINGS.iter().any(|tok| sl.contains(tok))
        {
            dropped += 1;
            continue;
        }
        out.push(s.to_string());
    }
    if dropped > 0 {
        tracing::debug!("post-filter dropped {dropped} prompt-leakage line(s)");
    }
    out
}

fn ts_rank(ts: &str) -> u8 {
    match ts.trim().to_lowercase().as_str() {
        "discharge" | "dc" => 2,
        "admission" | "adm" => 1,
        _ => 0,
    }
}

fn normalize_ts_alias(ts: &str) -> String {
    match ts.trim().to_lowercase().as_str() {
        "adm" => "Admission".to_string(),
        "dc" => "Discharge".to_string(),
        _ => ts.trim().to_string(),
    }
}

fn normalize_semantic_keyword(keyword: &str) -> String {
    let k = WS_RE.replace_all(keyword.trim(), " ").to_string();
    k.trim_end_matches([' ', ':', ';', ',', '.']).to_string()
}

fn split_semantic_items(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for seg in value.split([';', '\n']) {
        for item in seg.split(',') {
            let v = item
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .trim_matches(|c| c == ' ' || c == '-')
                .to_string();
            if v.is_empty() || sc_core::is_placeholder(&v) {
                continue;
            }
            if v.eq_ignore_ascii_case("nil") {
                continue;
            }
            if seen.insert(v.to_lowercase()) {
                out.push(v);
            }
        }
    }
    out
}

/// PROBLEMS value grammar with synonym folding; `None` drops the fact.
fn normalize_problem_value(value: &str, ts_raw: &str) -> Option<String> {
    let vv = WS_RE
        .replace_all(value.trim(), " ")
        .to_lowercase()
        .to_string();
    if vv.is_empty() || sc_core::is_placeholder(&vv) {
        return None;
    }
    match vv.as_str() {
        "chronic" | "acute" | "exist" | "not exist" => return Some(vv),
        "past" | "history" | "historical" | "pmh" | "chronic condition" | "chronic disease" => {
            return Some("chronic".to_string())
        }
        "discharge" | "discharged" | "active" | "current" => return Some("acute".to_string()),
        "present" | "yes" | "true" | "1" | "positive" | "confirmed" | "exists" => {
            return Some("exist".to_string())
        }
        "no" | "none" | "false" | "0" | "absent" | "negative" | "not present" | "ruled out" => {
            return Some("not exist".to_string())
        }
        _ => {}
    }
    let ts_cf = ts_raw.trim().to_lowercase();
    if (ts_cf == "discharge" || ts_cf == "dc") && vv.contains("discharg") {
        return Some("acute".to_string());
    }
    if ts_cf == "past" && (vv.contains("hist") || vv.contains("past")) {
        return Some("chronic".to_string());
    }
    None
}

/// SYMPTOMS value grammar; `None` drops the fact.
fn normalize_symptom_value(value: &str) -> Option<String> {
    let vv = WS_RE
        .replace_all(value.trim(), " ")
        .to_lowercase()
        .to_string();
    if vv.is_empty() || sc_core::is_placeholder(&vv) {
        return None;
    }
    match vv.as_str() {
        "yes" | "no" | "severe" => return Some(vv),
        "present" | "positive" | "true" | "1" | "y" | "symptomatic" => {
            return Some("yes".to_string())
        }
        "none" | "absent" | "negative" | "false" | "0" | "n" | "denied" | "denies" => {
            return Some("no".to_string())
        }
        "marked" | "significant" => return Some("severe".to_string()),
        _ => {}
    }
    if vv.contains("severe") {
        return Some("severe".to_string());
    }
    None
}

/// Step 5: expand aggregate PROBLEMS/SYMPTOMS lines into per-item facts.
fn expand_semantic_line(cluster: Cluster, keyword: &str, value: &str, ts_raw: &str) -> Vec<String> {
    if !matches!(cluster, Cluster::Problems | Cluster::Symptoms) {
        return vec![format!("{}|{keyword}|{value}|{ts_raw}", cluster.name())];
    }

    let kw = normalize_semantic_keyword(keyword);
    let kw_cf = kw.to_lowercase();
    let items = split_semantic_items(value);

    if cluster == Cluster::Problems {
        let acute = ["discharge dx", "working dx", "complication", "complications"];
        let chronic = ["pmh/comorbidities", "pmh", "comorbidities", "past medical history"];
        if acute.contains(&kw_cf.as_str()) && !items.is_empty() {
            return items
                .into_iter()
                .map(|it| format!("PROBLEMS|{it}|acute|Discharge"))
                .collect();
        }
        if chronic.contains(&kw_cf.as_str()) && !items.is_empty() {
            return items
                .into_iter()
                .map(|it| format!("PROBLEMS|{it}|chronic|Past"))
                .collect();
        }
        let Some(norm_v) = normalize_problem_value(value, ts_raw) else {
            return Vec::new();
        };
        let mut ts_out = ts_raw.to_string();
        if ts_out.trim().eq_ignore_ascii_case("unknown") {
            ts_out = match norm_v.as_str() {
                "acute" => "Discharge".to_string(),
                "chronic" => "Past".to_string(),
                _ => "Admission".to_string(),
            };
        }
        return vec![format!("PROBLEMS|{kw}|{norm_v}|{ts_out}")];
    }

    // SYMPTOMS
    let adm = ["adm symptoms", "admission symptoms", "admission sx"];
    let dc = ["dc symptoms", "discharge symptoms", "discharge sx"];
    if adm.contains(&kw_cf.as_str()) && !items.is_empty() {
        return items
            .into_iter()
            .map(|it| format!("SYMPTOMS|{it}|yes|Admission"))
            .collect();
    }
    if dc.contains(&kw_cf.as_str()) && !items.is_empty() {
        return items
            .into_iter()
            .map(|it| format!("SYMPTOMS|{it}|yes|Discharge"))
            .collect();
    }
    match normalize_symptom_value(value) {
        Some(v) => vec![format!("SYMPTOMS|{kw}|{v}|{ts_raw}")],
        None => Vec::new(),
    }
}

/// Steps 2–5: cluster/keyword recovery, value canonicalization, objective
/// dedup with timestamp priority, semantic expansion. Output is sorted by
/// `(cluster, keyword)` for stable artifacts.
pub fn sanitize_lines(lines: Vec<String>, scope: Stage2Scope, policy: &Stage2Policy) -> Vec<String> {
    // (cluster, keyword) → (cluster, keyword, value, ts, rank)
    let mut best_objective: BTreeMap<(String, String), (String, String, String, String, u8)> =
        BTreeMap::new();
    let mut other_lines: Vec<String> = Vec::new();

    for ln in &lines {
        let mut parts: Vec<String> = ln.split('|').map(|p| p.trim().to_string()).collect();

        // Recover 3-part lines: missing timestamp (leading cluster token) or
        // missing cluster (known canonical keyword).
        if policy.recover_3part_lines && parts.len() == 3 {
            if let Some(cluster) = Cluster::parse_loose(&parts[0]) {
                if !parts[1].is_empty() && !parts[2].is_empty() {
                    parts = vec![
                        cluster.name().to_string(),
                        parts[1].clone(),
                        parts[2].clone(),
                        cluster.canonical_timestamp().to_string(),
                    ];
                }
            } else if let Some(cluster) = cluster_for_keyword(&parts[0]) {
                if !parts[1].is_empty() && !parts[2].is_empty() {
                    parts = vec![
                        cluster.name().to_string(),
                        parts[0].clone(),
                        parts[1].clone(),
                        parts[2].clone(),
                    ];
                }
            }
        }

        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            continue;
        }
        let keyword = parts[1].clone();
        let mut value = parts[2].trim_start_matches('$').trim().to_string();
        let mut ts = normalize_ts_alias(&parts[3]);

        // "not stated" is a placeholder, not a fact.
        if value.eq_ignore_ascii_case("not stated") {
            continue;
        }

        let cluster = Cluster::parse_loose(&parts[0]);
        let Some(mut cluster) = cluster else {
            // Unknown cluster tokens survive only under scope `all`.
            if scope == Stage2Scope::All {
                other_lines.push(format!("{}|{keyword}|{value}|{ts}", parts[0]));
            }
            continue;
        };

        // A paired blood-pressure reading expands into two facts with the
        // same timestamp; the lone ratio is never a valid numeric value.
        if cluster == Cluster::Vitals {
            let kw_norm = normalize_sparse_key(&keyword);
            let is_bp_key = matches!(
                kw_norm.as_str(),
                "blood pressure" | "bp" | "systolic bp" | "systolic blood pressure"
            );
            if is_bp_key {
                if let Some(caps) = BP_RATIO_VALUE_RE.captures(&value) {
                    let rank = ts_rank(&ts);
                    for (canon, side) in [("Systolic BP", 1usize), ("Diastolic BP", 2usize)] {
                        let key = ("VITALS".to_string(), canon.to_string());
                        let should_insert = best_objective
                            .get(&key)
                            .map(|prev| rank > prev.4)
                            .unwrap_or(true);
                        if should_insert {
                            best_objective.insert(
                                key,
                                (
                                    "VITALS".to_string(),
                                    canon.to_string(),
                                    caps[side].to_string(),
                                    ts.clone(),
                                    rank,
                                ),
                            );
                        }
                    }
                    continue;
                }
            }
        }

        if cluster.is_numeric() && !NUM_RE.is_match(&value) {
            continue;
        }

        // Wrong-cluster repair for canonical non-numeric keywords. Never
        // reclassify into VITALS/LABS: the model echoes wrong numeric values
        // under PROBLEMS, and moving them would overwrite correct objective
        // lines via timestamp-priority dedup.
        if policy.reclassify_nonnumeric_clusters && cluster.is_semantic() {
            if let Some(correct) = cluster_for_keyword(&keyword) {
                if correct.is_objective() && !correct.is_numeric() {
                    cluster = correct;
                }
            }
        }

        if cluster.is_objective() {
            let rank = ts_rank(&ts);
            let key = (cluster.name().to_string(), keyword.clone());
            let should_insert = best_objective
                .get(&key)
                .map(|prev| rank > prev.4)
                .unwrap_or(true);
            if should_insert {
                best_objective.insert(
                    key,
                    (cluster.name().to_string(), keyword, value, ts, rank),
                );
            }
        } else if scope == Stage2Scope::All {
            if policy.expand_semantic_lines {
                other_lines.extend(expand_semantic_line(cluster, &keyword, &value, &ts));
            } else {
                // Binary-flag 0/1 still normalizes later; keep the line.
                value = value.trim().to_string();
                ts = ts.trim().to_string();
                other_lines.push(format!("{}|{keyword}|{value}|{ts}", cluster.name()));
            }
        }
    }

    let canonical_objective_ts =
        scope == Stage2Scope::Objective || policy.objective_ts_canonical_all;

    let mut out: Vec<String> = Vec::new();
    for ((cluster_name, _), (c, k, v, ts_raw, _)) in &best_objective {
        let ts = if canonical_objective_ts {
            let cluster: Cluster = cluster_name.parse().unwrap_or(Cluster::Demographics);
            cluster.canonical_timestamp().to_string()
        } else {
            ts_raw.clone()
        };
        out.push(format!("{c}|{k}|{v}|{ts}"));
    }

    if scope == Stage2Scope::All {
        // Dedup semantic lines by exact string only; multiple problems and
        // symptoms legitimately coexist.
        let mut seen: HashSet<String> = out.iter().cloned().collect();
        for ln in other_lines {
            if seen.insert(ln.clone()) {
                out.push(ln);
            }
        }
    }

    out.sort_by(|a, b| {
        let ka = (a.split('|').next().unwrap_or(""), a.splitn(3, '|').nth(1).unwrap_or(""));
        let kb = (b.split('|').next().unwrap_or(""), b.splitn(3, '|').nth(1).unwrap_or(""));
        ka.cmp(&kb)
    });
    out
}

/// Step 6: canonical yes/no (Dialysis: done/no) for the closed flag set.
pub fn normalize_binary_flags(lines: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut changed = 0usize;
    for ln in lines {
        let parts: Vec<&str> = ln.split('|').map(str::trim).collect();
        if parts.len() != 4 {
            out.push(ln);
            continue;
        }
        let (cluster, keyword, value, ts) = (parts[0], parts[1], parts[2], parts[3]);
        if !BINARY_FLAG_KEYWORDS.contains(&keyword) {
            out.push(format!("{cluster}|{keyword}|{value}|{ts}"));
            continue;
        }
        let vv = value.to_lowercase();
        let truthy = matches!(vv.as_str(), "1" | "1.0" | "true" | "yes" | "y");
        let falsy = matches!(vv.as_str(), "0" | "0.0" | "false" | "no" | "n");
        let new_value = if keyword == "Dialysis" {
            if truthy {
                "done"
            } else if falsy {
                "no"
            } else {
                value
            }
        } else if truthy {
            "yes"
        } else if falsy {
            "no"
        } else {
            value
        };
        if new_value != value {
            changed += 1;
        }
        out.push(format!("{cluster}|{keyword}|{new_value}|{ts}"));
    }
    if changed > 0 {
        tracing::debug!("post-filter normalized {changed} binary flag value(s)");
    }
    out
}

/// Step 7: drop fabricated negatives for clusters absent from the compacted
/// Stage-1 input. Absence is not evidence; a lone `Any Procedure|no` is kept
/// as the weak fallback signal.
pub fn drop_hallucinated_negatives(lines: Vec<String>, md_in: &str) -> Vec<String> {
    let mut present: HashSet<&str> = HashSet::new();
    for ln in md_in.lines() {
        if let Some(name) = ln.trim().strip_prefix("## ") {
            let name = name.trim().to_uppercase();
            if name == "MEDICATIONS" || name == "PROCEDURES" {
                present.insert(if name == "MEDICATIONS" {
                    "MEDICATIONS"
                } else {
                    "PROCEDURES"
                });
            }
        }
    }

    let mut out = Vec::with_capacity(lines.len());
    let mut dropped = 0usize;
    for ln in lines {
        let parts: Vec<&str> = ln.split('|').map(str::trim).collect();
        if parts.len() == 4 {
            let cluster = parts[0].to_uppercase();
            let guarded = cluster == "MEDICATIONS" || cluster == "PROCEDURES";
            if guarded
                && !present.contains(cluster.as_str())
                && parts[2].eq_ignore_ascii_case("no")
                && !(cluster == "PROCEDURES" && parts[1] == "Any Procedure")
            {
                dropped += 1;
                continue;
            }
        }
        out.push(ln);
    }
    if dropped > 0 {
        tracing::debug!("post-filter dropped {dropped} hallucinated negative(s) from absent cluster(s)");
    }
    out
}

static SURGERY_TERM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(surgery|surgical|ectomy|otomy|plasty|arthro|laparotomy|repair|resection|bypass|stent|amputation|transplant)")
        .expect("surgery term regex")
});
static SURGERY_SPECIFIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(cholecystectomy|appendectomy|hysterectomy|salpingectomy|arthroplasty|cabg|craniotomy|laparoscopic|hernia repair|resection)\b")
        .expect("specific surgery regex")
});
static SP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bs/p\b").expect("s/p regex"));
static NEGATED_SURGERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(without surgery|no surgery|denies surgery|declined surgery)\b")
        .expect("negated surgery regex")
});
static SURGERY_KV_NEG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(surgery|any procedure)\s*=\s*(no|0|0\.0|false|not stated)\s*$")
        .expect("surgery kv neg regex")
});
static SURGERY_KV_POS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*surgery\s*=\s*(yes|1|1\.0|true)\s*$").expect("surgery kv pos regex")
});
static SURGICAL_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*major surgical or invasive procedure\b").expect("surgical header regex")
});
static DIALYSIS_TERM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(dialysis|hemodialysis|cvvh)").expect("dialysis term regex"));
static VENT_TERM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(ventilation|ventilator|intubat)").expect("vent term regex"));

fn parse_stage1_procedures(md: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for ln in section_lines(md, "PROCEDURES") {
        let Some((k, v)) = ln.split_once('=') else { continue };
        let key = k.trim();
        if ["Any Procedure", "Surgery", "Dialysis", "Mechanical Ventilation"].contains(&key) {
            out.insert(key.to_string(), v.trim().to_string());
        }
    }
    out
}

fn has_surgery_text_evidence(md: &str) -> bool {
    for raw in md.lines() {
        let ln = raw.trim();
        if ln.is_empty()
            || SURGERY_KV_NEG_RE.is_match(ln)
            || SURGICAL_HEADER_RE.is_match(ln)
            || NEGATED_SURGERY_RE.is_match(ln)
        {
            continue;
        }
        if SURGERY_KV_POS_RE.is_match(ln)
            || SP_RE.is_match(ln)
            || SURGERY_SPECIFIC_RE.is_match(ln)
            || SURGERY_TERM_RE.is_match(ln)
        {
            return true;
        }
    }
    false
}

fn has_procedure_text_evidence(md: &str) -> bool {
    if has_surgery_text_evidence(md) {
        return true;
    }
    for ln in section_lines(md, "PROCEDURES") {
        if let Some((_, v)) = ln.split_once('=') {
            let vv = v.trim().to_lowercase();
            if sc_core::is_placeholder(&vv) || matches!(vv.as_str(), "no" | "0" | "0.0" | "false") {
                continue;
            }
        }
        if DIALYSIS_TERM_RE.is_match(&ln) || VENT_TERM_RE.is_match(&ln) {
            return true;
        }
    }
    false
}

/// Step 8: inject conservative PROCEDURES facts from Stage-1 evidence when
/// Stage 2 produced none (or inconsistent ones). Reads the *uncompacted*
/// Stage-1 Markdown so compaction cannot hide the evidence.
pub fn inject_stage1_procedure_fallback(lines: Vec<String>, full_md: &str) -> Vec<String> {
    let stage1_proc = parse_stage1_procedures(full_md);
    let has_surgery_evidence = has_surgery_text_evidence(full_md);
    let has_procedure_evidence = has_procedure_text_evidence(full_md);
    let has_procedure_section = full_md.to_uppercase().contains("## PROCEDURES");
    let default_no = crate::env::env_truthy("MEDGEMMA_STAGE1_ANY_PROCEDURE_DEFAULT_NO", true);

    let mut parsed: Vec<(String, String, String, String)> = Vec::new();
    let mut other: Vec<String> = Vec::new();
    for ln in &lines {
        let parts: Vec<&str> = ln.split('|').map(str::trim).collect();
        if parts.len() != 4 {
            continue;
        }
        if parts[0].eq_ignore_ascii_case("PROCEDURES") {
            parsed.push((
                parts[0].to_string(),
                parts[1].to_string(),
                parts[2].to_string(),
                parts[3].to_string(),
            ));
        } else {
            other.push(ln.clone());
        }
    }

    if parsed.is_empty() && stage1_proc.is_empty() && !has_procedure_evidence {
        // The section survived but no typed keys did: emit the weak
        // fallback signal only.
        if has_procedure_section && default_no {
            let mut out = lines;
            out.push("PROCEDURES|Any Procedure|no|Admission".to_string());
            return out;
        }
        return lines;
    }

    let mut by_kw: HashMap<String, (String, String, String, String)> = parsed
        .iter()
        .map(|item| (item.1.clone(), item.clone()))
        .collect();

    let any_v = normalize_binary_value(stage1_proc.get("Any Procedure").map(String::as_str).unwrap_or(""))
        .to_lowercase();
    let mut surg_v =
        normalize_binary_value(stage1_proc.get("Surgery").map(String::as_str).unwrap_or(""))
            .to_lowercase();
    let dial_raw = stage1_proc
        .get("Dialysis")
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    let vent_raw = stage1_proc
        .get("Mechanical Ventilation")
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    let dial_pos = matches!(
        dial_raw.as_str(),
        "started" | "done" | "decided" | "cancelled" | "yes" | "1" | "1.0" | "true" | "y"
    );
    let vent_pos = !vent_raw.is_empty()
        && !sc_core::is_placeholder(&vent_raw)
        && !matches!(vent_raw.as_str(), "no" | "0" | "0.0" | "false" | "n");
    let mut has_typed_positive =
        surg_v == "yes" || dial_pos || vent_pos || has_procedure_evidence;

    // Upcast only when Surgery is unknown; never override an explicit no.
    if has_surgery_evidence && surg_v != "yes" && surg_v != "no" {
        surg_v = "yes".to_string();
        has_typed_positive = true;
    }

    let mut injected = 0usize;
    let mut any_final = any_v.clone();
    if any_final == "yes" || any_final == "no" {
        // Guard inconsistent Any Procedure=yes without positive evidence.
        if any_final == "yes" && !has_typed_positive {
            any_final = "no".to_string();
        }
        by_kw.insert(
            "Any Procedure".to_string(),
            (
                "PROCEDURES".to_string(),
                "Any Procedure".to_string(),
                any_final,
                "Admission".to_string(),
            ),
        );
    } else if !has_typed_positive && default_no {
        by_kw.insert(
            "Any Procedure".to_string(),
            (
                "PROCEDURES".to_string(),
                "Any Procedure".to_string(),
                "no".to_string(),
                "Admission".to_string(),
            ),
        );
    } else if by_kw
        .get("Any Procedure")
        .map(|item| item.2.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
        && !has_typed_positive
    {
        // An unsupported generic positive from Stage 2 is a high-FP pattern.
        by_kw.remove("Any Procedure");
    }

    if surg_v == "yes" {
        by_kw.insert(
            "Surgery".to_string(),
            (
                "PROCEDURES".to_string(),
                "Surgery".to_string(),
                "yes".to_string(),
                "Past".to_string(),
            ),
        );
    } else if surg_v == "no"
        && !has_surgery_evidence
        && by_kw
            .get("Surgery")
            .map(|item| item.2.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    {
        by_kw.remove("Surgery");
    }

    let mut out = other;
    for kw in ["Any Procedure", "Surgery", "Dialysis", "Mechanical Ventilation"] {
        if let Some((c, k, v, t)) = by_kw.get(kw) {
            out.push(format!("{c}|{k}|{v}|{t}"));
            if !parsed.iter().any(|p| p.1 == *kw) {
                injected += 1;
            }
        }
    }
    if injected > 0 {
        tracing::debug!("post-filter injected {injected} PROCEDURES fallback fact(s) from Stage-1 evidence");
    }
    out
}

/// Step 9: remove binary `no` and `New Medications Count=0` lines. They
/// carry no risk signal and only inflate false positives against ground
/// truth.
pub fn drop_low_information_negatives(lines: Vec<String>) -> Vec<String> {
    const MED_BINARY: [&str; 5] = [
        "Polypharmacy",
        "Anticoagulation",
        "Insulin Therapy",
        "Opioid Therapy",
        "Diuretic Therapy",
    ];
    const PROC_SPECIFIC: [&str; 3] = ["Surgery", "Dialysis", "Mechanical Ventilation"];

    let mut out = Vec::with_capacity(lines.len());
    let mut dropped = 0usize;
    for ln in lines {
        let parts: Vec<&str> = ln.split('|').map(str::trim).collect();
        if parts.len() != 4 {
            out.push(ln);
            continue;
        }
        let cluster = parts[0].to_uppercase();
        let keyword = parts[1];
        let value_cf = parts[2].to_lowercase();

        if cluster == "MEDICATIONS" {
            if MED_BINARY.contains(&keyword) && value_cf == "no" {
                dropped += 1;
                continue;
            }
            if keyword == "New Medications Count" {
                if let Some(n) = extract_numeric(parts[2]).and_then(|n| n.parse::<f64>().ok()) {
                    if n == 0.0 {
                        dropped += 1;
                        continue;
                    }
                }
            }
        }
        if cluster == "PROCEDURES" && PROC_SPECIFIC.contains(&keyword) && value_cf == "no" {
            dropped += 1;
            continue;
        }
        out.push(ln);
    }
    if dropped > 0 {
        tracing::debug!("post-filter dropped {dropped} low-information negative fact(s)");
    }
    out
}

const SYMPTOM_FRAGMENT_STOP: [&str; 8] = [
    "and arm", "and leg", "and hand", "and face", "arm", "leg", "hand", "face",
];
const ANATOMIC_TOKENS: [&str; 13] = [
    "arm", "arms", "leg", "legs", "hand", "hands", "foot", "feet", "face", "ear", "ears", "eye",
    "eyes",
];
const DIR_OR_JOIN_TOKENS: [&str; 5] = ["left", "right", "bilateral", "and", "or"];

fn is_fragmented_symptom(keyword: &str) -> bool {
    let nk = normalize_sparse_key(keyword);
    if nk.is_empty() {
        return true;
    }
    if SYMPTOM_FRAGMENT_STOP.contains(&nk.as_str()) {
        return true;
    }
    if nk.starts_with("and ") || nk.starts_with("or ") {
        return true;
    }
    let toks: Vec<&str> = nk.split(' ').collect();
    toks.len() <= 2
        && toks
            .iter()
            .all(|t| ANATOMIC_TOKENS.contains(t) || DIR_OR_JOIN_TOKENS.contains(t))
}

/// Step 10: drop fragmented symptom keywords; dedup PROBLEMS preferring
/// `chronic|Past`, SYMPTOMS preferring Admission.
pub fn semantic_postprocess_gate(lines: Vec<String>) -> Vec<String> {
    type Item = (String, String, String, String);
    let mut non_semantic: Vec<String> = Vec::new();
    let mut passthrough: Vec<String> = Vec::new();
    let mut problems: BTreeMap<String, Vec<Item>> = BTreeMap::new();
    let mut symptoms: BTreeMap<String, Vec<Item>> = BTreeMap::new();
    let mut dropped_fragments = 0usize;

    for ln in lines {
        let parts: Vec<String> = ln.split('|').map(|p| p.trim().to_string()).collect();
        if parts.len() != 4 {
            continue;
        }
        let cluster = parts[0].to_uppercase();
        match cluster.as_str() {
            "PROBLEMS" => problems
                .entry(normalize_sparse_key(&parts[1]))
                .or_default()
                .push((parts[0].clone(), parts[1].clone(), parts[2].clone(), parts[3].clone())),
            "SYMPTOMS" => {
                if is_fragmented_symptom(&parts[1]) {
                    dropped_fragments += 1;
                    continue;
                }
                symptoms
                    .entry(normalize_sparse_key(&parts[1]))
                    .or_default()
                    .push((parts[0].clone(), parts[1].clone(), parts[2].clone(), parts[3].clone()));
            }
            "MEDICATIONS" | "PROCEDURES" => passthrough.push(ln),
            _ => non_semantic.push(ln),
        }
    }

    let mut out = non_semantic;

    for (_nk, items) in problems {
        let pick = items
            .iter()
            .find(|(_, _, v, t)| v.eq_ignore_ascii_case("chronic") || t == "Past")
            .or_else(|| items.first())
            .cloned();
        if let Some((c, k, v, t)) = pick {
            out.push(format!("{c}|{k}|{v}|{t}"));
        }
    }
    for (_nk, items) in symptoms {
        let pick = items
            .iter()
            .find(|(_, _, _, t)| t == "Admission")
            .or_else(|| items.first())
            .cloned();
        if let Some((c, k, v, t)) = pick {
            out.push(format!("{c}|{k}|{v}|{t}"));
        }
    }

    out.extend(passthrough);
    out.sort_by(|a, b| {
        let ka = (a.split('|').next().unwrap_or(""), a.splitn(3, '|').nth(1).unwrap_or(""));
        let kb = (b.split('|').next().unwrap_or(""), b.splitn(3, '|').nth(1).unwrap_or(""));
        ka.cmp(&kb)
    });
    if dropped_fragments > 0 {
        tracing::debug!("post-filter semantic gate dropped {dropped_fragments} symptom fragment(s)");
    }
    out
}

/// Step 11: drop every UTILIZATION fact when Stage 1 carries no
/// utilization evidence.
pub fn drop_utilization_without_evidence(lines: Vec<String>, md_in: &str) -> Vec<String> {
    if utilization_has_evidence(md_in) {
        return lines;
    }
    let mut dropped = 0usize;
    let out: Vec<String> = lines
        .into_iter()
        .filter(|ln| {
            let is_util = ln
                .split('|')
                .next()
                .map(|c| c.trim().eq_ignore_ascii_case("UTILIZATION"))
                .unwrap_or(false);
            if is_util {
                dropped += 1;
            }
            !is_util
        })
        .collect();
    if dropped > 0 {
        tracing::debug!("post-filter dropped {dropped} UTILIZATION fact(s) without Stage-1 evidence");
    }
    out
}

/// The full sanitizer chain in pipeline order. `md_in` is the (possibly
/// compacted) Stage-2 input Markdown; `full_md` the uncompacted Stage-1
/// Markdown used by the procedure fallback.
pub fn sanitize_stage2(
    lines: Vec<String>,
    scope: Stage2Scope,
    policy: &Stage2Policy,
    md_in: &str,
    full_md: &str,
) -> Vec<String> {
    let mut lines = sanitize_lines(lines, scope, policy);
    if policy.normalize_binary_flags {
        lines = normalize_binary_flags(lines);
    }
    if scope == Stage2Scope::All {
        lines = drop_hallucinated_negatives(lines, md_in);
        if policy.stage1_procedure_fallback {
            lines = inject_stage1_procedure_fallback(lines, full_md);
        }
        if policy.drop_low_info_negatives {
            lines = drop_low_information_negatives(lines);
        }
        if policy.semantic_gate {
            lines = semantic_postprocess_gate(lines);
        }
    }
    if policy.utilization_evidence_gate {
        lines = drop_utilization_without_evidence(lines, md_in);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validated() -> Stage2Policy {
        Stage2Policy::validated()
    }

    fn experimental() -> Stage2Policy {
        Stage2Policy::experimental()
    }

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_objective_dedup_timestamp_priority() {
        // Discharge beats Admission for the same (cluster, keyword).
        let out = sanitize_lines(
            lines(&[
                "VITALS|Heart Rate|88|Admission",
                "VITALS|Heart Rate|72|Discharge",
            ]),
            Stage2Scope::All,
            &validated(),
        );
        assert_eq!(out, vec!["VITALS|Heart Rate|72|Discharge"]);
    }

    #[test]
    fn test_objective_scope_canonical_timestamps() {
        let out = sanitize_lines(
            lines(&[
                "DISPOSITION|Discharge Disposition|Home|Unknown",
                "UTILIZATION|ED Visits 6mo|2|Admission",
                "LABS|WBC|7.7|DC",
            ]),
            Stage2Scope::Objective,
            &validated(),
        );
        assert!(out.contains(&"DISPOSITION|Discharge Disposition|Home|Discharge".to_string()));
        assert!(out.contains(&"UTILIZATION|ED Visits 6mo|2|Past".to_string()));
        assert!(out.contains(&"LABS|WBC|7.7|Admission".to_string()));
    }

    #[test]
    fn test_numeric_purity_enforced() {
        let out = sanitize_lines(
            lines(&[
                "VITALS|Heart Rate|rapid|Admission",
                "LABS|Glucose|$129|Admission",
                "UTILIZATION|ED Visits 6mo|two|Past",
            ]),
            Stage2Scope::All,
            &validated(),
        );
        assert_eq!(out, vec!["LABS|Glucose|129|Admission"]);
    }

    #[test]
    fn test_not_stated_dropped_everywhere() {
        let out = sanitize_lines(
            lines(&["DISPOSITION|Mental Status|not stated|Discharge"]),
            Stage2Scope::All,
            &validated(),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_three_field_recovery_flagged() {
        let input = lines(&["Heart Rate|88|Admission", "DISPOSITION|Discharge Disposition|Home"]);
        let off = sanitize_lines(input.clone(), Stage2Scope::All, &validated());
        assert!(off.is_empty());

        let on = sanitize_lines(input, Stage2Scope::All, &experimental());
        assert!(on.contains(&"VITALS|Heart Rate|88|Admission".to_string()));
        assert!(on.contains(&"DISPOSITION|Discharge Disposition|Home|Discharge".to_string()));
    }

    #[test]
    fn test_reclassify_never_into_numeric_clusters() {
        let out = sanitize_lines(
            lines(&[
                "PROBLEMS|Mental Status|confused|Discharge",
                "PROBLEMS|Heart Rate|88|Admission",
            ]),
            Stage2Scope::All,
            &experimental(),
        );
        // Mental Status moves to DISPOSITION; Heart Rate stays put (and is
        // then dropped by the problem-value grammar).
        assert!(out.contains(&"DISPOSITION|Mental Status|confused|Discharge".to_string()));
        assert!(!out.iter().any(|l| l.starts_with("VITALS|")));
    }

    #[test]
    fn test_semantic_expansion() {
        let out = sanitize_lines(
            lines(&["PROBLEMS|PMH/Comorbidities|CHF; COPD|Past"]),
            Stage2Scope::All,
            &experimental(),
        );
        assert!(out.contains(&"PROBLEMS|CHF|chronic|Past".to_string()));
        assert!(out.contains(&"PROBLEMS|COPD|chronic|Past".to_string()));
    }

    #[test]
    fn test_symptom_value_synonyms() {
        let out = sanitize_lines(
            lines(&[
                "SYMPTOMS|Dizziness|present|Admission",
                "SYMPTOMS|Nausea|denied|Admission",
            ]),
            Stage2Scope::All,
            &experimental(),
        );
        assert!(out.contains(&"SYMPTOMS|Dizziness|yes|Admission".to_string()));
        assert!(out.contains(&"SYMPTOMS|Nausea|no|Admission".to_string()));
    }

    #[test]
    fn test_prompt_leakage_filter() {
        let out = drop_prompt_leakage(lines(&[
            "## Canonical Keywords",
            "VITALS: Heart Rate, Systolic BP (MUST MATCH EXACTLY)",
            "VITALS|Heart Rate|88|Admission",
        ]));
        assert_eq!(out, vec!["VITALS|Heart Rate|88|Admission"]);
    }

    #[test]
    fn test_binary_flag_normalization() {
        let out = normalize_binary_flags(lines(&[
            "MEDICATIONS|Anticoagulation|1|Admission",
            "PROCEDURES|Dialysis|1|Admission",
            "PROCEDURES|Surgery|false|Past",
        ]));
        assert_eq!(
            out,
            vec![
                "MEDICATIONS|Anticoagulation|yes|Admission",
                "PROCEDURES|Dialysis|done|Admission",
                "PROCEDURES|Surgery|no|Past",
            ]
        );
    }

    #[test]
    fn test_hallucinated_negatives_guard() {
        let md_in = "## VITALS\nADM: Heart Rate=88\n";
        let out = drop_hallucinated_negatives(
            lines(&[
                "MEDICATIONS|Opioid Therapy|no|Admission",
                "PROCEDURES|Surgery|no|Admission",
                "PROCEDURES|Any Procedure|no|Admission",
                "VITALS|Heart Rate|88|Admission",
            ]),
            md_in,
        );
        assert_eq!(
            out,
            vec![
                "PROCEDURES|Any Procedure|no|Admission",
                "VITALS|Heart Rate|88|Admission",
            ]
        );
    }

    #[test]
    fn test_procedure_fallback_injects_from_stage1() {
        let full_md = "## PROCEDURES\nAny Procedure=yes\nSurgery=yes\n";
        let out = inject_stage1_procedure_fallback(
            lines(&["VITALS|Heart Rate|88|Admission"]),
            full_md,
        );
        assert!(out.contains(&"PROCEDURES|Surgery|yes|Past".to_string()));
        assert!(out.contains(&"PROCEDURES|Any Procedure|yes|Admission".to_string()));
    }

    #[test]
    fn test_procedure_fallback_weak_negative() {
        let full_md = "## PROCEDURES\n";
        let out = inject_stage1_procedure_fallback(Vec::new(), full_md);
        assert_eq!(out, vec!["PROCEDURES|Any Procedure|no|Admission"]);
    }

    #[test]
    fn test_low_information_negatives_dropped() {
        let out = drop_low_information_negatives(lines(&[
            "MEDICATIONS|Opioid Therapy|no|Admission",
            "MEDICATIONS|New Medications Count|0|Discharge",
            "MEDICATIONS|Anticoagulation|yes|Admission",
            "PROCEDURES|Dialysis|no|Admission",
            "PROCEDURES|Any Procedure|no|Admission",
        ]));
        assert_eq!(
            out,
            vec![
                "MEDICATIONS|Anticoagulation|yes|Admission",
                "PROCEDURES|Any Procedure|no|Admission",
            ]
        );
    }

    #[test]
    fn test_semantic_gate_fragments_and_dedup() {
        let out = semantic_postprocess_gate(lines(&[
            "SYMPTOMS|and arm|yes|Admission",
            "SYMPTOMS|Dizziness|yes|Discharge",
            "SYMPTOMS|Dizziness|yes|Admission",
            "PROBLEMS|Hypertension|acute|Discharge",
            "PROBLEMS|Hypertension|chronic|Past",
        ]));
        assert!(out.contains(&"SYMPTOMS|Dizziness|yes|Admission".to_string()));
        assert!(out.contains(&"PROBLEMS|Hypertension|chronic|Past".to_string()));
        assert_eq!(out.iter().filter(|l| l.contains("Dizziness")).count(), 1);
        assert_eq!(out.iter().filter(|l| l.contains("Hypertension")).count(), 1);
        assert!(!out.iter().any(|l| l.contains("and arm")));
    }

    proptest::proptest! {
        // Numeric purity: after sanitation every surviving VITALS/LABS/
        // UTILIZATION value is a bare number.
        #[test]
        fn prop_numeric_purity(value in "[A-Za-z0-9/.% ]{1,12}") {
            let input = vec![format!("LABS|Glucose|{}|Admission", value.trim())];
            let out = sanitize_lines(input, Stage2Scope::All, &validated());
            for ln in out {
                let v = ln.split('|').nth(2).unwrap_or("");
                proptest::prop_assert!(NUM_RE.is_match(v), "impure value survived: {v}");
            }
        }
    }

    #[test]
    fn test_utilization_evidence_gate() {
        let md_without = "## UTILIZATION\nPrior Admissions 12mo=not stated\n";
        let out = drop_utilization_without_evidence(
            lines(&["UTILIZATION|Prior Admissions 12mo|2|Past"]),
            md_without,
        );
        assert!(out.is_empty());

        let md_with = "## UTILIZATION\nPrior Admissions 12mo=2\n";
        let out = drop_utilization_without_evidence(
            lines(&["UTILIZATION|Prior Admissions 12mo|2|Past"]),
            md_with,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_bp_pair_line_yields_two_facts() {
        // One paired line in, exactly two numeric facts out, same timestamp.
        let out = sanitize_lines(
            lines(&["VITALS|Blood Pressure|140/90|Admission"]),
            Stage2Scope::All,
            &validated(),
        );
        assert_eq!(
            out,
            vec![
                "VITALS|Diastolic BP|90|Admission",
                "VITALS|Systolic BP|140|Admission",
            ]
        );

        // The digest-side normalizer expands the same shape.
        let expanded = crate::stage1::normalize::sanitize_vitals_text("Blood Pressure=140/90");
        assert_eq!(expanded, "Systolic BP=140; Diastolic BP=90");
    }
}
