//! Objective KVT4 export from the normalized Stage-1 digest.
//!
//! Stage 2 may drift into partial lines; Stage 1 already carries stabilized
//! objective evidence, so it is exported as KVT4 directly and merged with
//! the Stage-2 stream downstream. These facts never depend on Stage-2
//! fidelity.

use super::normalize::extract_numeric;
use sc_core::{
    normalize_lab_key, normalize_sparse_key, Cluster, ClusterValue, Digest, Fact, Timestamp,
    DISPOSITION_KEYS, LABS_ORDER, UTILIZATION_KEYS, VITALS_ORDER,
};
use std::collections::BTreeMap;

fn emit(out: &mut Vec<Fact>, cluster: Cluster, keyword: &str, value: &str, ts: Timestamp) {
    let v = value.trim();
    if keyword.trim().is_empty() || v.is_empty() {
        return;
    }
    if sc_core::is_placeholder(v) {
        return;
    }
    out.push(Fact::new(cluster, keyword.trim(), v, ts));
}

/// Parse `Key=value` pairs from semicolon- or newline-separated text.
/// First occurrence of a key wins.
fn parse_kv_pairs(text: &str) -> BTreeMap<String, String> {
    let mut kv = BTreeMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let chunks: Vec<&str> = if line.contains(';') {
            line.split(';').map(str::trim).collect()
        } else {
            vec![line]
        };
        for chunk in chunks {
            let Some((k, v)) = chunk.split_once('=') else {
                continue;
            };
            let key = k.trim().to_string();
            let val = v.trim().to_string();
            if !key.is_empty() && !val.is_empty() {
                kv.entry(key).or_insert(val);
            }
        }
    }
    kv
}

fn canonical_key(raw: &str, allowed: &'static [&'static str]) -> Option<&'static str> {
    let normed = normalize_sparse_key(raw);
    for canon in allowed.iter().copied() {
        if normalize_sparse_key(canon) == normed {
            return Some(canon);
        }
    }
    // Lab aliases map to canonical names too.
    let aliased = normalize_lab_key(raw);
    allowed.iter().find(|c| **c == aliased).copied()
}

fn emit_objective_block(
    out: &mut Vec<Fact>,
    cluster: Cluster,
    value: &ClusterValue,
    allowed: &'static [&'static str],
) {
    match value {
        ClusterValue::Objective(block) => {
            for (map, ts) in [
                (&block.admission, Timestamp::Admission),
                (&block.discharge, Timestamp::Discharge),
            ] {
                for (k, v) in map {
                    let Some(canon) = canonical_key(k, allowed) else {
                        continue;
                    };
                    let Some(num) = extract_numeric(v) else { continue };
                    emit(out, cluster, canon, &num, ts);
                }
            }
        }
        other => {
            for raw in other.as_text().lines() {
                let line = raw.trim();
                if line.is_empty() || line.eq_ignore_ascii_case(sc_core::NOT_STATED) {
                    continue;
                }
                let (ts, rest) = match line.split_once(':') {
                    Some((head, rest)) if head.trim().eq_ignore_ascii_case("adm") => {
                        (Timestamp::Admission, rest.trim())
                    }
                    Some((head, rest)) if head.trim().eq_ignore_ascii_case("dc") => {
                        (Timestamp::Discharge, rest.trim())
                    }
                    _ => (Timestamp::Admission, line),
                };
                let kv = parse_kv_pairs(rest);
                for canon in allowed {
                    let Some(val) = kv.get(*canon) else { continue };
                    let Some(num) = extract_numeric(val) else { continue };
                    emit(out, cluster, canon, &num, ts);
                }
            }
        }
    }
}

/// Emit canonical objective facts (DEMOGRAPHICS, VITALS, LABS, UTILIZATION,
/// DISPOSITION) from the normalized digest.
pub fn objective_facts(digest: &Digest) -> Vec<Fact> {
    let mut out: Vec<Fact> = Vec::new();

    // DEMOGRAPHICS
    let demo = parse_kv_pairs(&digest.demographics.as_text());
    let sex = demo
        .get("Sex")
        .or_else(|| demo.get("sex"))
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    if sex == "male" || sex == "female" {
        emit(&mut out, Cluster::Demographics, "Sex", &sex, Timestamp::Admission);
    }
    if let Some(age) = demo.get("Age").or_else(|| demo.get("age")) {
        if !sc_core::is_placeholder(age) {
            if let Some(num) = extract_numeric(age) {
                emit(&mut out, Cluster::Demographics, "Age", &num, Timestamp::Admission);
            }
        }
    }

    emit_objective_block(&mut out, Cluster::Vitals, &digest.vitals, &VITALS_ORDER);
    emit_objective_block(&mut out, Cluster::Labs, &digest.labs, &LABS_ORDER);

    // UTILIZATION: numeric-only, Past.
    let util = parse_kv_pairs(&digest.utilization.as_text());
    for canon in UTILIZATION_KEYS {
        let Some(val) = util.get(canon) else { continue };
        if sc_core::is_placeholder(val) {
            continue;
        }
        if let Some(num) = extract_numeric(val) {
            emit(&mut out, Cluster::Utilization, canon, &num, Timestamp::Past);
        }
    }

    // DISPOSITION: closed keys, Discharge.
    let dispo = parse_kv_pairs(&digest.disposition.as_text());
    for canon in DISPOSITION_KEYS {
        let Some(val) = dispo.get(canon) else { continue };
        emit(&mut out, Cluster::Disposition, canon, val, Timestamp::Discharge);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_hygiene_export() {
        // Normalized "Age=not stated" must not produce an Age fact;
        // Sex=female still exports.
        let mut d = Digest::default();
        d.demographics = ClusterValue::Text("Sex=female\nAge=not stated".into());
        let facts = objective_facts(&d);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].to_string(), "DEMOGRAPHICS|Sex|female|Admission");
    }

    #[test]
    fn test_vitals_adm_dc_lines() {
        let mut d = Digest::default();
        d.vitals = ClusterValue::Text(
            "ADM: Heart Rate=88; Systolic BP=140\nDC: Heart Rate=72".into(),
        );
        let facts = objective_facts(&d);
        let lines: Vec<String> = facts.iter().map(|f| f.to_string()).collect();
        assert!(lines.contains(&"VITALS|Heart Rate|88|Admission".to_string()));
        assert!(lines.contains(&"VITALS|Systolic BP|140|Admission".to_string()));
        assert!(lines.contains(&"VITALS|Heart Rate|72|Discharge".to_string()));
    }

    #[test]
    fn test_utilization_past_timestamp() {
        let mut d = Digest::default();
        d.utilization = ClusterValue::Text("Prior Admissions 12mo=2\nCurrent Length of Stay=5".into());
        let facts = objective_facts(&d);
        assert!(facts.iter().all(|f| f.timestamp == Timestamp::Past));
        assert_eq!(facts.len(), 2);
    }

    #[test]
    fn test_disposition_discharge_timestamp() {
        let mut d = Digest::default();
        d.disposition = ClusterValue::Text(
            "Discharge Disposition=Home\nMental Status=alert\nSupport Needs=not stated".into(),
        );
        let facts = objective_facts(&d);
        let lines: Vec<String> = facts.iter().map(|f| f.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "DISPOSITION|Discharge Disposition|Home|Discharge",
                "DISPOSITION|Mental Status|alert|Discharge",
            ]
        );
    }

    #[test]
    fn test_objective_block_export() {
        let mut d = Digest::default();
        let mut block = sc_core::ObjectiveBlock::default();
        block.admission.insert("wbc".into(), "7.7".into());
        block.discharge.insert("Hemoglobin".into(), "11.0".into());
        d.labs = ClusterValue::Objective(block);
        let facts = objective_facts(&d);
        let lines: Vec<String> = facts.iter().map(|f| f.to_string()).collect();
        assert!(lines.contains(&"LABS|WBC|7.7|Admission".to_string()));
        assert!(lines.contains(&"LABS|Hemoglobin|11.0|Discharge".to_string()));
    }
}
