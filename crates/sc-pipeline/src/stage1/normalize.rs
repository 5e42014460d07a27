//! Deterministic hygiene for the Stage-1 digest.
//!
//! Every rule here is pure string work: placeholder removal, BP expansion,
//! numeric-only enforcement, alias mapping, closed-set canonicalization, and
//! evidence gating for PROCEDURES. The result is the normalized digest the
//! Markdown projector and objective fact export read from.

use crate::env::env_truthy;
use crate::markdown::semantic_item_clean;
use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::{
    normalize_lab_key, normalize_sparse_key, Cluster, ClusterValue, Digest, ObjectiveBlock,
    LABS_ORDER, MEDICATIONS_KEYS, NOT_STATED, VITALS_ORDER,
};
use std::collections::BTreeMap;

static STAR_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(-?\d+(?:\.\d+)?)\*").expect("star suffix regex"));
static SPO2_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bSpO2\s*=\s*(-?\d+(?:\.\d+)?)\s*%?(?:\s*RA\b)?").expect("spo2 regex")
});
static BP_PAIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:Systolic BP|Blood Pressure|BP)\s*=\s*(-?\d+(?:\.\d+)?)\s*/\s*(-?\d+(?:\.\d+)?)\b",
    )
    .expect("bp pair regex")
});
static BP_KEYED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Systolic BP|Diastolic BP)\s*=\s*(-?\d+(?:\.\d+)?)\s*/\s*(-?\d+(?:\.\d+)?)\b")
        .expect("bp keyed regex")
});
static FIRST_NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("first num regex"));

static SURGERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(surgery|surgical|ectomy|otomy|plasty|arthro|laparotomy|repair|resection|bypass|stent|amputation|transplant)")
        .expect("surgery regex")
});
static NEGATED_SURGERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(without surgery|no surgery|denies surgery|declined surgery)\b")
        .expect("negated surgery regex")
});
static HISTORICAL_PROC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(history of|hx of|h/o|s/p|status post|prior|previous)\b")
        .expect("historical regex")
});
static DIALYSIS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(dialysis|hemodialysis|cvvh)").expect("dialysis regex"));
static VENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(ventilation|ventilator|intubat)").expect("vent regex"));
static PROCEDURE_MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(surgery|surgical|ectomy|otomy|plasty|arthro|laparotomy|repair|resection|bypass|stent|amputation|transplant|dialysis|hemodialysis|cvvh|ventilation|ventilator|intubat|extubat|tracheostom)",
    )
    .expect("procedure mention regex")
});

pub fn extract_numeric(value: &str) -> Option<String> {
    FIRST_NUM_RE.find(value).map(|m| m.as_str().to_string())
}

/// Canonical yes/no for binary flag text; placeholders become `not stated`.
pub fn normalize_binary_value(value: &str) -> String {
    let lv = value.trim().to_lowercase();
    if sc_core::is_placeholder(&lv) {
        return NOT_STATED.to_string();
    }
    match lv.as_str() {
        "1" | "1.0" | "true" | "yes" | "y" => "yes".to_string(),
        "0" | "0.0" | "false" | "no" | "n" => "no".to_string(),
        _ => value.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// DEMOGRAPHICS
// ---------------------------------------------------------------------------

pub fn sanitize_demographics_text(text: &str) -> String {
    let t = text.trim();
    if t.is_empty() {
        return format!("Sex={NOT_STATED}\nAge={NOT_STATED}");
    }

    // Degenerate single-token outputs.
    if t.eq_ignore_ascii_case("f") {
        return format!("Sex=female\nAge={NOT_STATED}");
    }
    if t.eq_ignore_ascii_case("m") {
        return format!("Sex=male\nAge={NOT_STATED}");
    }

    let t = t.replace("Sex=F", "Sex=female").replace("Sex=M", "Sex=male");

    let has_sex = t.to_lowercase().contains("sex=");
    let has_age = t.to_lowercase().contains("age=");
    let mut lines: Vec<String> = t
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if !has_sex {
        lines.insert(0, format!("Sex={NOT_STATED}"));
    }
    if !has_age {
        lines.push(format!("Age={NOT_STATED}"));
    }
    lines.truncate(2);
    lines.join("\n")
}

fn sanitize_demographics(value: &ClusterValue) -> ClusterValue {
    // Structured sgr_v4 objects arrive as text of JSON shape through the
    // untagged fallback; parse either way into canonical two-line text.
    let text = value.as_text();
    if let Ok(obj) = serde_json::from_str::<serde_json::Value>(&text) {
        if obj.is_object() {
            let sex_raw = obj
                .get("sex")
                .or_else(|| obj.get("Sex"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_lowercase();
            let sex = match sex_raw.as_str() {
                "m" | "male" => "male".to_string(),
                "f" | "female" => "female".to_string(),
                _ => NOT_STATED.to_string(),
            };
            let age_raw = obj
                .get("age")
                .or_else(|| obj.get("Age"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            let age = if age_raw.is_empty() || age_raw.eq_ignore_ascii_case(NOT_STATED) {
                NOT_STATED.to_string()
            } else {
                extract_numeric(&age_raw).unwrap_or(age_raw)
            };
            return ClusterValue::Text(format!("Sex={sex}\nAge={age}"));
        }
    }
    ClusterValue::Text(sanitize_demographics_text(&text))
}

// ---------------------------------------------------------------------------
// VITALS / LABS
// ---------------------------------------------------------------------------

/// Shared numeric-decoration cleanup for vitals/labs text:
/// strip `*` flags, collapse `SpO2=98% RA`, expand BP pairs.
pub fn sanitize_vitals_or_labs_text(text: &str) -> String {
    let t = text.trim();
    if t.is_empty() {
        return NOT_STATED.to_string();
    }

    let t = STAR_SUFFIX_RE.replace_all(t, "$1").to_string();
    let t = SPO2_RE.replace_all(&t, "SpO2=$1").to_string();

    // "BP=120/80" or "Systolic BP=120/80" → two fields, same line.
    let t = BP_PAIR_RE
        .replace_all(&t, "Systolic BP=$1; Diastolic BP=$2")
        .to_string();

    // A stray keyed ratio picks its own side.
    BP_KEYED_RE
        .replace_all(&t, |caps: &regex::Captures| {
            let key = caps[1].to_lowercase();
            if key.starts_with("systolic") {
                format!("Systolic BP={}", &caps[2])
            } else {
                format!("Diastolic BP={}", &caps[3])
            }
        })
        .to_string()
}

/// Split an `ADM:`/`DC:` prefix off a line.
fn split_adm_dc(line: &str) -> (Option<&'static str>, &str) {
    if let Some((head, rest)) = line.split_once(':') {
        match head.trim().to_uppercase().as_str() {
            "ADM" => return (Some("ADM"), rest.trim()),
            "DC" => return (Some("DC"), rest.trim()),
            _ => {}
        }
    }
    (None, line)
}

fn numeric_for_vital(key: &str, value: &str) -> Option<String> {
    match key {
        "SpO2" => {
            let cleaned = value.replace('%', "").replace("RA", "").replace("ra", "");
            extract_numeric(&cleaned)
        }
        "Weight" => {
            let nums: Vec<&str> = FIRST_NUM_RE.find_iter(value).map(|m| m.as_str()).collect();
            if value.to_lowercase().contains("kg") && !nums.is_empty() {
                // lbs/kg dual readings list kg last.
                Some(nums[nums.len() - 1].to_string())
            } else {
                nums.first().map(|s| s.to_string())
            }
        }
        _ => extract_numeric(value),
    }
}

fn rebuild_kv_lines(
    text: &str,
    canonical_order: &[&str],
    canonicalize_key: impl Fn(&str) -> String,
    numeric_for: impl Fn(&str, &str) -> Option<String>,
) -> String {
    let cleaned = sanitize_vitals_or_labs_text(text);
    if cleaned == NOT_STATED {
        return cleaned;
    }

    let mut out_lines: Vec<String> = Vec::new();
    for raw in cleaned.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (prefix, rest) = split_adm_dc(line);

        let mut kv: BTreeMap<&str, String> = BTreeMap::new();
        for part in rest.split(';') {
            let Some((k, v)) = part.split_once('=') else {
                continue;
            };
            let key = canonicalize_key(k.trim());
            let Some(canon) = canonical_order.iter().copied().find(|c| *c == key) else {
                continue;
            };
            let val = v.trim();
            if val.eq_ignore_ascii_case(NOT_STATED) {
                continue;
            }
            if let Some(num) = numeric_for(canon, val) {
                kv.entry(canon).or_insert(num);
            }
        }

        if kv.is_empty() {
            continue;
        }
        let rebuilt = canonical_order
            .iter()
            .filter_map(|k| kv.get(k).map(|v| format!("{k}={v}")))
            .collect::<Vec<_>>()
            .join("; ");
        match prefix {
            Some(p) => out_lines.push(format!("{p}: {rebuilt}")),
            None => out_lines.push(rebuilt),
        }
    }

    if out_lines.is_empty() {
        NOT_STATED.to_string()
    } else {
        out_lines.join("\n")
    }
}

pub fn sanitize_vitals_text(text: &str) -> String {
    rebuild_kv_lines(text, &VITALS_ORDER, |k| k.to_string(), numeric_for_vital)
}

pub fn sanitize_labs_text(text: &str) -> String {
    rebuild_kv_lines(text, &LABS_ORDER, normalize_lab_key, |_, v| extract_numeric(v))
}

/// sgr_v4 objective objects: keep the shape, force numeric-only values.
fn sanitize_objective_block(block: &ObjectiveBlock, kind: Cluster) -> ObjectiveBlock {
    let mut out = ObjectiveBlock::default();
    for (src, dst) in [
        (&block.admission, &mut out.admission),
        (&block.discharge, &mut out.discharge),
    ] {
        for (key, raw) in src {
            let val = raw.trim();
            if val.is_empty() || val.eq_ignore_ascii_case(NOT_STATED) {
                dst.insert(key.clone(), NOT_STATED.to_string());
                continue;
            }
            let normed = normalize_sparse_key(key);
            let num = if val.contains('/') {
                // Paired reading: the diastolic key takes the second side.
                let side = if kind == Cluster::Vitals && normed.contains("diastolic") {
                    1
                } else {
                    0
                };
                val.split('/').nth(side).and_then(|s| extract_numeric(s))
            } else if kind == Cluster::Vitals && normed == "weight" {
                numeric_for_vital("Weight", val)
            } else {
                let cleaned = val.replace('%', "").replace("RA", "").replace("ra", "");
                extract_numeric(&cleaned)
            };
            dst.insert(key.clone(), num.unwrap_or_else(|| NOT_STATED.to_string()));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// MEDICATIONS
// ---------------------------------------------------------------------------

pub fn sanitize_medications_text(text: &str) -> String {
    let t = text.trim();
    if t.is_empty() {
        return NOT_STATED.to_string();
    }

    let mut vals: BTreeMap<&str, String> = MEDICATIONS_KEYS
        .iter()
        .map(|k| (*k, NOT_STATED.to_string()))
        .collect();

    for raw in t.lines() {
        let line = raw.trim();
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        let Some(canon) = MEDICATIONS_KEYS.iter().find(|c| **c == key) else {
            continue;
        };
        let val = v.trim();
        let normalized = if matches!(*canon, "Medication Count" | "New Medications Count") {
            extract_numeric(val).unwrap_or_else(|| NOT_STATED.to_string())
        } else {
            normalize_binary_value(val)
        };
        vals.insert(*canon, normalized);
    }

    MEDICATIONS_KEYS
        .iter()
        .map(|k| format!("{k}={}", vals[k]))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// PROCEDURES
// ---------------------------------------------------------------------------

pub fn note_has_procedure_mention(note_text: &str) -> bool {
    PROCEDURE_MENTION_RE.is_match(note_text.trim())
}

fn empty_procedures() -> String {
    format!(
        "Any Procedure={NOT_STATED}\nSurgery={NOT_STATED}\nDialysis={NOT_STATED}\nMechanical Ventilation={NOT_STATED}"
    )
}

/// Canonicalize the PROCEDURES block to the four integral keys with typed
/// value grammars, gated on note evidence.
pub fn sanitize_procedures_text(text: &str, note_text: &str) -> String {
    let t = text.trim();
    if t.is_empty() {
        return empty_procedures();
    }

    let mut any_proc = "no".to_string();
    let mut surgery = "no".to_string();
    let mut dialysis = "no".to_string();
    let mut ventilation = "no".to_string();

    // Prefer explicit canonical keys if already present.
    let mut explicit: BTreeMap<&str, String> = BTreeMap::new();
    for raw in t.lines() {
        let line = raw.trim();
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if let Some(canon) = ["Any Procedure", "Surgery", "Dialysis", "Mechanical Ventilation"]
            .iter()
            .find(|c| **c == key)
        {
            explicit.insert(*canon, v.trim().to_string());
        }
    }

    if !explicit.is_empty() {
        any_proc = normalize_binary_value(explicit.get("Any Procedure").map(String::as_str).unwrap_or(&any_proc));
        surgery = normalize_binary_value(explicit.get("Surgery").map(String::as_str).unwrap_or(&surgery));

        let dial_raw = explicit
            .get("Dialysis")
            .map(String::as_str)
            .unwrap_or(&dialysis)
            .trim()
            .to_lowercase();
        let dial_raw = match dial_raw.as_str() {
            "0" | "0.0" | "false" | "n" | "no" => "no".to_string(),
            "1" | "1.0" | "true" | "y" | "yes" => "done".to_string(),
            other => other.to_string(),
        };
        dialysis = if ["started", "done", "decided", "cancelled", "no"].contains(&dial_raw.as_str())
        {
            dial_raw
        } else if sc_core::is_placeholder(&dial_raw) {
            NOT_STATED.to_string()
        } else if dial_raw.is_empty() {
            NOT_STATED.to_string()
        } else {
            "done".to_string()
        };

        let vent_raw = explicit
            .get("Mechanical Ventilation")
            .map(String::as_str)
            .unwrap_or(&ventilation)
            .trim()
            .to_string();
        let vent_cf = vent_raw.to_lowercase();
        ventilation = if sc_core::is_placeholder(&vent_cf) {
            NOT_STATED.to_string()
        } else if matches!(vent_cf.as_str(), "0" | "0.0" | "false" | "n" | "no") {
            "no".to_string()
        } else if matches!(vent_cf.as_str(), "1" | "1.0" | "true" | "y" | "yes") {
            "1".to_string()
        } else {
            extract_numeric(&vent_raw).unwrap_or_else(|| normalize_binary_value(&vent_raw))
        };
    } else {
        // Free-text fallback: scan lines for procedure morphemes.
        for raw in t.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let (key, val) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => ("", line),
            };
            let merged = format!("{key} {val}").trim().to_string();
            let lv = val.to_lowercase();
            let bin = normalize_binary_value(val).to_lowercase();
            let is_historical = HISTORICAL_PROC_RE.is_match(&merged);
            let mut is_present = bin == "yes";
            if !is_present && !matches!(bin.as_str(), "yes" | "no" | "not stated") {
                is_present = !sc_core::is_placeholder(&lv) && lv != "no";
            }
            if is_present && !is_historical {
                any_proc = "yes".to_string();
            }
            if SURGERY_RE.is_match(&merged)
                && !NEGATED_SURGERY_RE.is_match(&merged)
                && is_present
            {
                surgery = "yes".to_string();
            }
            if DIALYSIS_RE.is_match(&merged) {
                if bin == "no" {
                    dialysis = "no".to_string();
                } else if bin != "not stated" && !sc_core::is_placeholder(&lv) {
                    dialysis = "done".to_string();
                }
            }
            if VENT_RE.is_match(&merged) {
                if bin == "no" {
                    ventilation = "no".to_string();
                } else if bin != "not stated" && !sc_core::is_placeholder(&lv) {
                    ventilation = extract_numeric(val).unwrap_or_else(|| "yes".to_string());
                }
            }
        }
    }

    // Harmonize generic "yes" to the minimum valid typed value.
    if dialysis == "yes" {
        dialysis = "done".to_string();
    }
    if ventilation == "yes" {
        ventilation = "1".to_string();
    }

    // Optional strict anti-hallucination mode: typed negatives become unknown.
    if env_truthy("MEDGEMMA_STAGE1_PROCEDURES_TYPED_NEG_TO_NOT_STATED", false) {
        if surgery == "no" {
            surgery = NOT_STATED.to_string();
        }
        if dialysis == "no" {
            dialysis = NOT_STATED.to_string();
        }
        if ventilation == "no" {
            ventilation = NOT_STATED.to_string();
        }
        if any_proc == "no"
            && surgery == NOT_STATED
            && dialysis == NOT_STATED
            && ventilation == NOT_STATED
        {
            any_proc = NOT_STATED.to_string();
        }
    }

    // All-negative defaults with no note evidence are a hallucination
    // signature; downgrade the whole block to unknown.
    if env_truthy("MEDGEMMA_STAGE1_PROCEDURES_REQUIRE_EVIDENCE", true) {
        let has_pos_dialysis = matches!(dialysis.as_str(), "started" | "done" | "decided" | "cancelled");
        let has_pos_vent =
            !matches!(ventilation.as_str(), "no" | "not stated" | "0" | "0.0" | "false");
        let has_positive = surgery == "yes" || any_proc == "yes" || has_pos_dialysis || has_pos_vent;
        if !has_positive && !note_has_procedure_mention(note_text) {
            return empty_procedures();
        }
    }

    format!(
        "Any Procedure={any_proc}\nSurgery={surgery}\nDialysis={dialysis}\nMechanical Ventilation={ventilation}"
    )
}

// ---------------------------------------------------------------------------
// DISPOSITION
// ---------------------------------------------------------------------------

fn disposition_allowlist(token: &str) -> Option<&'static str> {
    match token.trim().to_lowercase().as_str() {
        "home" => Some("Home"),
        "home with services" | "home with service" | "home w services" | "home w service"
        | "home + services" => Some("Home with Services"),
        "snf" | "skilled nursing facility" | "extended care" | "extended" => Some("SNF"),
        "rehab" | "rehabilitation" => Some("Rehab"),
        "ltac" => Some("LTAC"),
        "hospice" => Some("Hospice"),
        "ama" | "left ama" => Some("AMA"),
        _ => None,
    }
}

pub fn sanitize_mental_status_value(value: &str) -> String {
    let v = value.trim().to_lowercase();
    if v.is_empty() || v == "..." {
        return NOT_STATED.to_string();
    }
    if v.contains("clear") || v.contains("coherent") {
        return "alert".to_string();
    }
    if v.contains("intact") || v.contains("oriented") {
        return "oriented".to_string();
    }
    if v.contains("letharg") {
        return "lethargic".to_string();
    }
    if v.contains("confus") {
        return "confused".to_string();
    }
    if matches!(v.as_str(), "alert" | "confused" | "oriented" | "lethargic") {
        return v;
    }
    NOT_STATED.to_string()
}

pub fn sanitize_disposition_text(text: &str) -> String {
    let t = text.trim();
    let mut dispo = String::new();
    let mut mental = String::new();
    let mut support = String::new();

    let mut set_if_empty = |slot: &mut String, val: &str| {
        let v = val.trim();
        if !v.is_empty() && (slot.is_empty() || slot.eq_ignore_ascii_case(NOT_STATED)) {
            *slot = v.to_string();
        }
    };

    for raw in t.lines() {
        let mut line = raw.trim().to_string();
        if line.is_empty() {
            continue;
        }
        // Normalize "Key: value" to "Key=value".
        if line.contains(':') && !line.contains('=') {
            if let Some((k, v)) = line.split_once(':') {
                line = format!("{}={}", k.trim(), v.trim());
            }
        }

        if let Some((k, v)) = line.split_once('=') {
            let key = k.trim().to_lowercase();
            let val = v.trim();
            match key.as_str() {
                "discharge disposition" | "disposition" => {
                    let mapped = disposition_allowlist(val).unwrap_or(val);
                    set_if_empty(&mut dispo, mapped);
                }
                "mental status" | "mental" => {
                    set_if_empty(&mut mental, &sanitize_mental_status_value(val));
                }
                "support needs" | "support" => set_if_empty(&mut support, val),
                _ => {}
            }
            continue;
        }

        // Bare tokens like "Home" are common on small models.
        if let Some(mapped) = disposition_allowlist(&line) {
            set_if_empty(&mut dispo, mapped);
            continue;
        }
        let ms = sanitize_mental_status_value(&line);
        if ms != NOT_STATED {
            set_if_empty(&mut mental, &ms);
        }
    }

    let dispo = if dispo.is_empty() { NOT_STATED } else { dispo.as_str() };
    let mental = if mental.is_empty() { NOT_STATED } else { mental.as_str() };
    let support = if support.is_empty() { NOT_STATED } else { support.as_str() };
    format!("Discharge Disposition={dispo}\nMental Status={mental}\nSupport Needs={support}")
}

// ---------------------------------------------------------------------------
// PROBLEMS / SYMPTOMS
// ---------------------------------------------------------------------------

/// Flatten a semantic array: split embedded lists, clean placeholder
/// leakage, dedup by sparse-normalized form.
fn normalize_semantic_items(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for item in items {
        for seg in item.split([';', '\n']) {
            for piece in seg.split(',') {
                let s = semantic_item_clean(piece);
                if s.is_empty() {
                    continue;
                }
                let key = normalize_sparse_key(&s);
                if key.is_empty() || seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                out.push(s);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Digest-level entry point
// ---------------------------------------------------------------------------

/// Generic drift cleanup applied before the per-cluster grammars:
/// pipes become spaces, de-identification placeholders become `not stated`.
fn scrub_text(value: &str) -> String {
    value.replace('|', " ").replace("___", NOT_STATED)
}

fn scrub_value(value: &ClusterValue) -> ClusterValue {
    match value {
        ClusterValue::Text(s) => ClusterValue::Text(scrub_text(s)),
        ClusterValue::Problems(p) => {
            let mut p = p.clone();
            for list in [
                &mut p.pmh_comorbidities,
                &mut p.discharge_dx,
                &mut p.complications,
                &mut p.working_dx,
            ] {
                *list = list.iter().map(|s| scrub_text(s)).collect();
            }
            ClusterValue::Problems(p)
        }
        ClusterValue::Symptoms(s) => {
            let mut s = s.clone();
            s.admission = s.admission.iter().map(|x| scrub_text(x)).collect();
            s.discharge = s.discharge.iter().map(|x| scrub_text(x)).collect();
            ClusterValue::Symptoms(s)
        }
        ClusterValue::Objective(o) => {
            let mut o = o.clone();
            for map in [&mut o.admission, &mut o.discharge] {
                for v in map.values_mut() {
                    *v = scrub_text(v);
                }
            }
            ClusterValue::Objective(o)
        }
    }
}

/// Normalize a raw extracted digest into the canonical shape the projector
/// and fact export consume. `note_text` backs the PROCEDURES evidence gate.
pub fn normalize_digest(digest: &Digest, note_text: &str) -> Digest {
    let mut out = Digest::default();
    for cluster in Cluster::ALL {
        *out.get_mut(cluster) = scrub_value(digest.get(cluster));
    }

    out.demographics = sanitize_demographics(&out.demographics);

    out.vitals = match &out.vitals {
        ClusterValue::Objective(o) => {
            ClusterValue::Objective(sanitize_objective_block(o, Cluster::Vitals))
        }
        v => ClusterValue::Text(sanitize_vitals_text(&v.as_text())),
    };
    out.labs = match &out.labs {
        ClusterValue::Objective(o) => {
            ClusterValue::Objective(sanitize_objective_block(o, Cluster::Labs))
        }
        v => ClusterValue::Text(sanitize_labs_text(&v.as_text())),
    };

    out.problems = match &out.problems {
        ClusterValue::Problems(p) => {
            let mut p = p.clone();
            p.pmh_comorbidities = normalize_semantic_items(&p.pmh_comorbidities);
            p.discharge_dx = normalize_semantic_items(&p.discharge_dx);
            p.complications = normalize_semantic_items(&p.complications);
            p.working_dx = normalize_semantic_items(&p.working_dx);
            ClusterValue::Problems(p)
        }
        v => v.clone(),
    };
    out.symptoms = match &out.symptoms {
        ClusterValue::Symptoms(s) => {
            let mut s = s.clone();
            s.admission = normalize_semantic_items(&s.admission);
            s.discharge = normalize_semantic_items(&s.discharge);
            ClusterValue::Symptoms(s)
        }
        v => v.clone(),
    };

    out.medications = ClusterValue::Text(sanitize_medications_text(&out.medications.as_text()));
    out.procedures = ClusterValue::Text(sanitize_procedures_text(
        &out.procedures.as_text(),
        note_text,
    ));
    out.disposition = ClusterValue::Text(sanitize_disposition_text(&out.disposition.as_text()));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demographics_placeholder_hygiene() {
        // Age=___ and Sex=F normalize to not stated / female.
        let out = sanitize_demographics_text(&scrub_text("Sex=F\nAge=___"));
        assert_eq!(out, "Sex=female\nAge=not stated");
    }

    #[test]
    fn test_demographics_degenerate_token() {
        assert_eq!(sanitize_demographics_text("F"), "Sex=female\nAge=not stated");
        assert_eq!(sanitize_demographics_text(""), "Sex=not stated\nAge=not stated");
    }

    #[test]
    fn test_bp_pair_expansion() {
        let out = sanitize_vitals_text("ADM: BP=140/90; Heart Rate=88");
        assert_eq!(out, "ADM: Heart Rate=88; Systolic BP=140; Diastolic BP=90");
    }

    #[test]
    fn test_systolic_labeled_pair_expansion() {
        let out = sanitize_vitals_text("Systolic BP=169/99");
        assert_eq!(out, "Systolic BP=169; Diastolic BP=99");
    }

    #[test]
    fn test_spo2_decoration_stripped() {
        let out = sanitize_vitals_text("SpO2=98% RA; Temperature=98.6");
        assert_eq!(out, "Temperature=98.6; SpO2=98");
    }

    #[test]
    fn test_star_flag_stripped() {
        let out = sanitize_labs_text("WBC=15.2*; Hemoglobin=11.0");
        assert_eq!(out, "Hemoglobin=11.0; WBC=15.2");
    }

    #[test]
    fn test_lab_alias_mapping() {
        let out = sanitize_labs_text("Hgb=11.0; Urea N=17; Total CO2=28; ASA=NEG");
        assert_eq!(out, "Hemoglobin=11.0; BUN=17; Bicarbonate=28");
    }

    #[test]
    fn test_weight_prefers_kg() {
        let out = sanitize_vitals_text("Weight=154 lbs (70 kg)");
        assert_eq!(out, "Weight=70");
    }

    #[test]
    fn test_medications_canonical_block() {
        let out = sanitize_medications_text("Anticoagulation=1\nMedication Count=12 meds\nOther=x");
        assert!(out.contains("Medication Count=12"));
        assert!(out.contains("Anticoagulation=yes"));
        assert!(out.contains("Insulin Therapy=not stated"));
        assert!(!out.contains("Other"));
    }

    #[test]
    fn test_procedures_evidence_gate() {
        // All-negative defaults without note evidence downgrade to unknown.
        let out = sanitize_procedures_text(
            "Any Procedure=no\nSurgery=no\nDialysis=no\nMechanical Ventilation=no",
            "Patient admitted with dizziness. No interventions documented.",
        );
        assert_eq!(out, empty_procedures());
    }

    #[test]
    fn test_procedures_positive_kept() {
        let out = sanitize_procedures_text(
            "Any Procedure=yes\nSurgery=yes\nDialysis=no\nMechanical Ventilation=no",
            "s/p cholecystectomy",
        );
        assert!(out.contains("Surgery=yes"));
        assert!(out.contains("Any Procedure=yes"));
    }

    #[test]
    fn test_procedures_generic_yes_harmonized() {
        let out = sanitize_procedures_text(
            "Dialysis=yes\nMechanical Ventilation=yes",
            "started hemodialysis, intubated",
        );
        assert!(out.contains("Dialysis=done"));
        assert!(out.contains("Mechanical Ventilation=1"));
    }

    #[test]
    fn test_disposition_canonical_lines() {
        let out = sanitize_disposition_text("Discharge Disposition: home health\nMental Status: clear and coherent");
        assert_eq!(
            out,
            "Discharge Disposition=home health\nMental Status=alert\nSupport Needs=not stated"
        );
    }

    #[test]
    fn test_disposition_bare_token() {
        let out = sanitize_disposition_text("Home");
        assert!(out.starts_with("Discharge Disposition=Home"));
    }

    #[test]
    fn test_mental_status_phrases() {
        assert_eq!(sanitize_mental_status_value("clear and coherent"), "alert");
        assert_eq!(sanitize_mental_status_value("grossly intact"), "oriented");
        assert_eq!(sanitize_mental_status_value("somewhat confused"), "confused");
        assert_eq!(sanitize_mental_status_value("..."), "not stated");
    }

    #[test]
    fn test_semantic_items_split_and_dedup() {
        let items = vec![
            "Hypertension; Diabetes".to_string(),
            "hypertension".to_string(),
            "___".to_string(),
        ];
        let out = normalize_semantic_items(&items);
        assert_eq!(out, vec!["Hypertension", "Diabetes"]);
    }
}
