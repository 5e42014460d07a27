//! Ground-truth comparison metrics for the Stage-2 fact stream.
//!
//! Keys are `(cluster, keyword)`. Numeric clusters match within a relative
//! tolerance; everything else matches case-insensitively. An optional
//! semantic mode folds PROBLEMS/SYMPTOMS values into presence booleans and
//! matches on the keyword alone.

use sc_core::Cluster;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Best-effort projection of a ground-truth JSON object into KVT4 lines.
///
/// Supported shapes: a list of strings, a list of fact dicts
/// (`cluster|CLUSTER|C`, …), a dict wrapping such a list under
/// `facts`/`toon_facts`/`kvt_facts`/`fact_lines`/`lines`, or a dict with a
/// pipe-text blob under `text`/`raw`.
pub fn project_gt_to_kvt4_lines(gt: &Value) -> Vec<String> {
    fn as_str(v: Option<&Value>) -> String {
        match v {
            None | Some(Value::Null) => String::new(),
            Some(Value::Bool(b)) => if *b { "true" } else { "false" }.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn from_fact_dict(d: &Value) -> Option<String> {
        let get = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| d.get(*n))
                .map(|v| as_str(Some(v)).trim().to_string())
                .unwrap_or_default()
        };
        let cluster = get(&["cluster", "CLUSTER", "C"]);
        let keyword = get(&["keyword", "KEYWORD", "K"]);
        let value = get(&["value", "VALUE", "V"]);
        let mut timestamp = get(&["timestamp", "TIMESTAMP", "T"]);
        if cluster.is_empty() || keyword.is_empty() {
            return None;
        }
        if timestamp.is_empty() {
            timestamp = "Unknown".to_string();
        }
        Some(format!("{cluster}|{keyword}|{value}|{timestamp}"))
    }

    match gt {
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    Value::String(s) => {
                        let s = s.trim();
                        if !s.is_empty() {
                            out.push(s.to_string());
                        }
                    }
                    Value::Object(_) => {
                        if let Some(line) = from_fact_dict(item) {
                            out.push(line);
                        }
                    }
                    _ => {}
                }
            }
            out
        }
        Value::Object(map) => {
            for key in ["facts", "toon_facts", "kvt_facts", "fact_lines", "lines"] {
                if let Some(v @ Value::Array(_)) = map.get(key) {
                    return project_gt_to_kvt4_lines(v);
                }
            }
            let blob = as_str(map.get("text").or_else(|| map.get("raw")));
            if blob.contains('|') {
                return blob
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Metrics {
    pub tp: usize,
    pub fp: usize,
    pub fn_: usize,
}

impl Metrics {
    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 {
            0.0
        } else {
            self.tp as f64 / denom as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 {
            0.0
        } else {
            self.tp as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Per-item match records for explainable evaluation output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchDetails {
    pub tp: Vec<Value>,
    pub fp: Vec<Value>,
    pub fn_: Vec<Value>,
}

fn keyword_norm(k: &str) -> String {
    k.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn semantic_value_present(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "acute" | "chronic" | "exist" | "yes" | "severe" => Some(true),
        "not exist" | "no" => Some(false),
        _ => None,
    }
}

fn parse_line(line: &str) -> Option<(String, String, String, String)> {
    let parts: Vec<&str> = line.split('|').map(str::trim).collect();
    if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some((
        parts[0].to_uppercase(),
        parts[1].to_string(),
        parts[2].to_string(),
        parts[3].to_string(),
    ))
}

fn lines_to_map(lines: &[String]) -> BTreeMap<(String, String), (String, String)> {
    let mut out = BTreeMap::new();
    for ln in lines {
        if let Some((c, k, v, t)) = parse_line(ln) {
            out.insert((c, k), (v, t));
        }
    }
    out
}

fn is_semantic_cluster(name: &str) -> bool {
    name == "PROBLEMS" || name == "SYMPTOMS"
}

fn is_numeric_cluster(name: &str) -> bool {
    name.parse::<Cluster>()
        .map(|c| c.is_numeric())
        .unwrap_or(false)
}

fn values_match(cluster: &str, pred: &str, gt: &str) -> bool {
    if is_numeric_cluster(cluster) {
        let (Ok(p), Ok(g)) = (pred.trim().parse::<f64>(), gt.trim().parse::<f64>()) else {
            return false;
        };
        let tol = (0.10 * g.abs()).max(0.01);
        (p - g).abs() <= tol
    } else {
        pred.trim().to_lowercase() == gt.trim().to_lowercase()
    }
}

/// Compare predicted lines against ground truth.
pub fn compute_metrics(
    pred_lines: &[String],
    gt_lines: &[String],
    require_timestamp_match: bool,
    semantic_keyword_only_match: bool,
) -> (Metrics, MatchDetails) {
    let pred = lines_to_map(pred_lines);
    let gt = lines_to_map(gt_lines);

    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    let mut matched: HashSet<(String, String)> = HashSet::new();
    let mut details = MatchDetails::default();

    // Semantic GT candidates by normalized keyword, consumed at most once.
    let mut gt_semantic_by_kw: HashMap<String, Vec<((String, String), (String, String))>> =
        HashMap::new();
    if semantic_keyword_only_match {
        for ((gc, gk), (gv, gt_t)) in &gt {
            if is_semantic_cluster(gc) {
                gt_semantic_by_kw
                    .entry(keyword_norm(gk))
                    .or_default()
                    .push(((gc.clone(), gk.clone()), (gv.clone(), gt_t.clone())));
            }
        }
    }

    for ((c, k), (pv, pt)) in &pred {
        if semantic_keyword_only_match && is_semantic_cluster(c) {
            let candidates = gt_semantic_by_kw.get(&keyword_norm(k)).cloned().unwrap_or_default();
            if candidates.is_empty() {
                fp += 1;
                details.fp.push(serde_json::json!({
                    "cluster": c, "keyword": k, "pred": {"V": pv, "T": pt}, "reason": "not_in_gt"
                }));
                continue;
            }

            let pred_present = semantic_value_present(pv);
            let mut best: Option<((String, String), (String, String))> = None;
            let mut best_reason = "value_mismatch";
            for (gkey, (gv, gt_t)) in &candidates {
                if matched.contains(gkey) {
                    continue;
                }
                if require_timestamp_match && pt != gt_t {
                    best_reason = "timestamp_mismatch";
                    continue;
                }
                let gt_present = semantic_value_present(gv);
                match (pred_present, gt_present) {
                    (Some(p), Some(g)) if p == g => {
                        best = Some((gkey.clone(), (gv.clone(), gt_t.clone())));
                        break;
                    }
                    _ => best_reason = "value_mismatch",
                }
            }

            match best {
                Some((gkey, (gv, gt_t))) => {
                    tp += 1;
                    matched.insert(gkey.clone());
                    details.tp.push(serde_json::json!({
                        "cluster": gkey.0, "keyword": gkey.1,
                        "pred": {"C": c, "K": k, "V": pv, "T": pt},
                        "gt": {"V": gv, "T": gt_t},
                    }));
                }
                None => {
                    fp += 1;
                    details.fp.push(serde_json::json!({
                        "cluster": c, "keyword": k, "pred": {"V": pv, "T": pt},
                        "reason": best_reason,
                    }));
                }
            }
            continue;
        }

        match gt.get(&(c.clone(), k.clone())) {
            None => {
                fp += 1;
                details.fp.push(serde_json::json!({
                    "cluster": c, "keyword": k, "pred": {"V": pv, "T": pt}, "reason": "not_in_gt"
                }));
            }
            Some((gv, gt_t)) => {
                if require_timestamp_match && pt != gt_t {
                    fp += 1;
                    details.fp.push(serde_json::json!({
                        "cluster": c, "keyword": k, "pred": {"V": pv, "T": pt},
                        "gt": {"V": gv, "T": gt_t}, "reason": "timestamp_mismatch"
                    }));
                } else if !values_match(c, pv, gv) {
                    fp += 1;
                    details.fp.push(serde_json::json!({
                        "cluster": c, "keyword": k, "pred": {"V": pv, "T": pt},
                        "gt": {"V": gv, "T": gt_t}, "reason": "value_mismatch"
                    }));
                } else {
                    tp += 1;
                    matched.insert((c.clone(), k.clone()));
                    details.tp.push(serde_json::json!({
                        "cluster": c, "keyword": k,
                        "pred": {"V": pv, "T": pt}, "gt": {"V": gv, "T": gt_t}
                    }));
                }
            }
        }
    }

    for ((c, k), (gv, gt_t)) in &gt {
        if matched.contains(&(c.clone(), k.clone())) {
            continue;
        }
        fn_ += 1;
        details.fn_.push(serde_json::json!({
            "cluster": c, "keyword": k, "gt": {"V": gv, "T": gt_t}
        }));
    }

    (Metrics { tp, fp, fn_ }, details)
}

// ---------------------------------------------------------------------------
// Downstream-weighted score
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DownstreamConfig {
    pub cluster_weights: BTreeMap<String, f64>,
    pub lambda_fn: f64,
    pub lambda_fp: f64,
    pub critical_fn_clusters: Vec<String>,
    pub critical_fp_clusters: Vec<String>,
    /// cluster → minimum recall gate; an empty map disables gating.
    pub gates: BTreeMap<String, f64>,
}

impl DownstreamConfig {
    pub fn default_config() -> Self {
        let cluster_weights = BTreeMap::from([
            ("VITALS".to_string(), 0.20),
            ("LABS".to_string(), 0.15),
            ("PROBLEMS".to_string(), 0.15),
            ("SYMPTOMS".to_string(), 0.05),
            ("MEDICATIONS".to_string(), 0.05),
            ("PROCEDURES".to_string(), 0.05),
            ("UTILIZATION".to_string(), 0.20),
            ("DISPOSITION".to_string(), 0.15),
            ("DEMOGRAPHICS".to_string(), 0.00),
        ]);
        Self {
            cluster_weights,
            lambda_fn: 0.02,
            lambda_fp: 0.01,
            critical_fn_clusters: vec![
                "DISPOSITION".to_string(),
                "UTILIZATION".to_string(),
                "PROBLEMS".to_string(),
            ],
            critical_fp_clusters: vec!["VITALS".to_string(), "LABS".to_string()],
            gates: BTreeMap::from([("VITALS".to_string(), 0.85)]),
        }
    }

    pub fn without_gates(mut self) -> Self {
        self.gates.clear();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerClusterCounts {
    pub tp: usize,
    pub fp: usize,
    pub fn_: usize,
}

pub fn per_cluster_counts(details: &MatchDetails) -> BTreeMap<String, PerClusterCounts> {
    let mut counts: BTreeMap<String, PerClusterCounts> = Cluster::ALL
        .iter()
        .map(|c| (c.name().to_string(), PerClusterCounts::default()))
        .collect();
    for (bucket, items) in [
        ("tp", &details.tp),
        ("fp", &details.fp),
        ("fn", &details.fn_),
    ] {
        for item in items {
            let Some(c) = item.get("cluster").and_then(Value::as_str) else {
                continue;
            };
            let entry = counts.entry(c.to_uppercase()).or_default();
            match bucket {
                "tp" => entry.tp += 1,
                "fp" => entry.fp += 1,
                _ => entry.fn_ += 1,
            }
        }
    }
    counts
}

fn safe_f1(tp: usize, fp: usize, fn_: usize) -> f64 {
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        0.0
    } else {
        2.0 * tp as f64 / denom as f64
    }
}

fn safe_recall(tp: usize, fn_: usize) -> f64 {
    let denom = tp + fn_;
    if denom == 0 {
        0.0
    } else {
        tp as f64 / denom as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownstreamReport {
    pub gate_passed: bool,
    pub gate_failures: Vec<Value>,
    pub weighted_f1_sum: f64,
    pub critical_fn: usize,
    pub critical_fp: usize,
    pub penalty: f64,
    pub score: f64,
    pub f1_by_cluster: BTreeMap<String, f64>,
    pub per_cluster: BTreeMap<String, PerClusterCounts>,
}

/// Weighted per-cluster F1 minus penalties for critical misses; a failed
/// recall gate makes the score negative infinity.
pub fn compute_downstream_score(
    details: &MatchDetails,
    cfg: &DownstreamConfig,
) -> (f64, DownstreamReport) {
    let per_cluster = per_cluster_counts(details);

    let mut gate_failures: Vec<Value> = Vec::new();
    for (cluster, min_recall) in &cfg.gates {
        let Some(counts) = per_cluster.get(cluster) else {
            continue;
        };
        let recall = safe_recall(counts.tp, counts.fn_);
        if recall < *min_recall {
            gate_failures.push(serde_json::json!({
                "cluster": cluster, "recall": recall, "min_recall": min_recall
            }));
        }
    }
    if !gate_failures.is_empty() {
        let report = DownstreamReport {
            gate_passed: false,
            gate_failures,
            weighted_f1_sum: 0.0,
            critical_fn: 0,
            critical_fp: 0,
            penalty: 0.0,
            score: f64::NEG_INFINITY,
            f1_by_cluster: BTreeMap::new(),
            per_cluster,
        };
        return (f64::NEG_INFINITY, report);
    }

    let mut weighted_f1_sum = 0.0;
    let mut f1_by_cluster = BTreeMap::new();
    for (cluster, weight) in &cfg.cluster_weights {
        let Some(counts) = per_cluster.get(cluster) else {
            continue;
        };
        let f1 = safe_f1(counts.tp, counts.fp, counts.fn_);
        f1_by_cluster.insert(cluster.clone(), f1);
        weighted_f1_sum += weight * f1;
    }

    let critical_fn: usize = cfg
        .critical_fn_clusters
        .iter()
        .filter_map(|c| per_cluster.get(c))
        .map(|c| c.fn_)
        .sum();
    let critical_fp: usize = cfg
        .critical_fp_clusters
        .iter()
        .filter_map(|c| per_cluster.get(c))
        .map(|c| c.fp)
        .sum();
    let penalty = cfg.lambda_fn * critical_fn as f64 + cfg.lambda_fp * critical_fp as f64;
    let score = weighted_f1_sum - penalty;

    let report = DownstreamReport {
        gate_passed: true,
        gate_failures,
        weighted_f1_sum,
        critical_fn,
        critical_fp,
        penalty,
        score,
        f1_by_cluster,
        per_cluster,
    };
    (score, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_gt_projection_shapes() {
        let list = json!(["VITALS|Heart Rate|88|Admission"]);
        assert_eq!(project_gt_to_kvt4_lines(&list), s(&["VITALS|Heart Rate|88|Admission"]));

        let dicts = json!([{"C": "LABS", "K": "WBC", "V": 7.7, "T": "ADM"}]);
        assert_eq!(project_gt_to_kvt4_lines(&dicts), s(&["LABS|WBC|7.7|ADM"]));

        let wrapped = json!({"facts": [{"cluster": "DEMOGRAPHICS", "keyword": "Sex", "value": "female", "timestamp": ""}]});
        assert_eq!(
            project_gt_to_kvt4_lines(&wrapped),
            s(&["DEMOGRAPHICS|Sex|female|Unknown"])
        );

        let blob = json!({"text": "VITALS|SpO2|98|Admission\n"});
        assert_eq!(project_gt_to_kvt4_lines(&blob), s(&["VITALS|SpO2|98|Admission"]));
    }

    #[test]
    fn test_numeric_tolerance() {
        let pred = s(&["LABS|WBC|7.5|Admission"]);
        let gt = s(&["LABS|WBC|7.7|Admission"]);
        let (m, _) = compute_metrics(&pred, &gt, false, false);
        // |7.5 - 7.7| = 0.2 <= 10% of 7.7.
        assert_eq!(m.tp, 1);

        let pred = s(&["LABS|WBC|10.0|Admission"]);
        let (m, _) = compute_metrics(&pred, &gt, false, false);
        assert_eq!(m.fp, 1);
        assert_eq!(m.fn_, 1);
    }

    #[test]
    fn test_timestamp_match_optional() {
        let pred = s(&["DISPOSITION|Discharge Disposition|Home|Admission"]);
        let gt = s(&["DISPOSITION|Discharge Disposition|Home|Discharge"]);
        let (m, _) = compute_metrics(&pred, &gt, false, false);
        assert_eq!(m.tp, 1);
        let (m, _) = compute_metrics(&pred, &gt, true, false);
        assert_eq!(m.fp, 1);
    }

    #[test]
    fn test_semantic_keyword_only_mode() {
        let pred = s(&["PROBLEMS|Hypertension|exist|Unknown"]);
        let gt = s(&["PROBLEMS|hypertension|chronic|Past"]);
        let (m, _) = compute_metrics(&pred, &gt, false, true);
        // Both map to "present" and the keyword matches modulo case.
        assert_eq!(m.tp, 1);
        assert_eq!(m.fn_, 0);
    }

    #[test]
    fn test_downstream_gate() {
        let pred = s(&["VITALS|Heart Rate|88|Admission"]);
        let gt = s(&[
            "VITALS|Heart Rate|88|Admission",
            "VITALS|SpO2|98|Admission",
            "VITALS|Temperature|98.6|Admission",
        ]);
        let (_, details) = compute_metrics(&pred, &gt, false, false);

        let gated = DownstreamConfig::default_config();
        let (score, report) = compute_downstream_score(&details, &gated);
        // Recall 1/3 fails the 0.85 VITALS gate.
        assert!(score.is_infinite() && score.is_sign_negative());
        assert!(!report.gate_passed);

        let nogate = DownstreamConfig::default_config().without_gates();
        let (score, report) = compute_downstream_score(&details, &nogate);
        assert!(score.is_finite());
        assert!(report.gate_passed);
    }

    #[test]
    fn test_f1_math() {
        let m = Metrics { tp: 8, fp: 2, fn_: 2 };
        assert!((m.precision() - 0.8).abs() < 1e-9);
        assert!((m.recall() - 0.8).abs() < 1e-9);
        assert!((m.f1() - 0.8).abs() < 1e-9);
    }
}
