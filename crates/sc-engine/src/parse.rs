//! Engine-side parsing of the merged KVT4 stream.

use crate::rules::{RuleBundle, RuleKind};
use once_cell::sync::Lazy;
use regex::Regex;
use sc_core::Cluster;
use std::collections::{HashMap, HashSet};

static FIRST_NUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("numeric token regex"));

/// Parsed value: numeric when the rule expects (and the text yields) a
/// number, the raw string otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FactValue::Number(n) => Some(*n),
            FactValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            FactValue::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            FactValue::Text(s) => s.clone(),
        }
    }

    /// Lowercased trimmed text form, for categorical comparisons.
    pub fn as_key(&self) -> String {
        self.as_text().trim().to_lowercase()
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFact {
    pub cluster: Cluster,
    pub keyword: String,
    pub value: FactValue,
    pub timestamp: String,
    pub plausibility_ok: bool,
}

/// Facts grouped by cluster plus parse counters.
#[derive(Debug, Clone, Default)]
pub struct FactSet {
    by_cluster: HashMap<Cluster, Vec<ParsedFact>>,
    pub n_parsed: usize,
    pub n_dropped: usize,
}

impl FactSet {
    pub fn cluster(&self, cluster: Cluster) -> &[ParsedFact] {
        self.by_cluster.get(&cluster).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_cluster(&self, cluster: Cluster) -> bool {
        self.by_cluster
            .get(&cluster)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn missing_clusters(&self) -> Vec<Cluster> {
        Cluster::ALL
            .iter()
            .copied()
            .filter(|c| !self.has_cluster(*c))
            .collect()
    }

    fn push(&mut self, fact: ParsedFact) {
        self.by_cluster.entry(fact.cluster).or_default().push(fact);
        self.n_parsed += 1;
    }

    /// First numeric value for `(cluster, keyword)`, used by pattern gates.
    pub fn number(&self, cluster: Cluster, keyword: &str) -> Option<f64> {
        self.cluster(cluster)
            .iter()
            .find(|f| f.keyword == keyword)
            .and_then(|f| f.value.as_number())
    }

    /// First value as lowercase text for `(cluster, keyword)`.
    pub fn text(&self, cluster: Cluster, keyword: &str) -> Option<String> {
        self.cluster(cluster)
            .iter()
            .find(|f| f.keyword == keyword)
            .map(|f| f.value.as_key())
    }
}

/// Best-effort numeric parse. Numeric fields should arrive clean, but light
/// decoration like `3 days` still appears; the first numeric token is
/// accepted. Ratios like `120/80` are rejected outright so an unexpanded BP
/// pair can never score as a single value.
pub fn try_parse_number(value: &str) -> Option<f64> {
    let s = value.trim();
    if s.is_empty() || s.contains('/') {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    FIRST_NUM_RE
        .find(s)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

const PROBLEM_PREFIXES: [&str; 6] = [
    "PMH:",
    "PMH/Comorbidities:",
    "Discharge Dx:",
    "Working Dx:",
    "Complication:",
    "Complications:",
];

const SYMPTOM_PREFIXES: [&str; 2] = ["ADM:", "DC:"];

fn strip_prefixes(keyword: &str, prefixes: &[&str]) -> String {
    let mut k = keyword.trim().to_string();
    for p in prefixes {
        if k.to_lowercase().starts_with(&p.to_lowercase()) {
            k = k[p.len()..].trim().to_string();
        }
    }
    k
}

/// Split a semicolon/comma/newline separated list into deduped items.
fn split_semantic_items(value: &str) -> Vec<String> {
    const LIMIT: usize = 20;
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for seg in value.split(|c| c == ';' || c == '\n') {
        for item in seg.split(',') {
            let it = item
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .trim_matches(|c| c == ' ' || c == '-')
                .to_string();
            if it.is_empty() {
                continue;
            }
            let key = it.to_lowercase();
            if seen.insert(key) {
                out.push(it);
                if out.len() >= LIMIT {
                    return out;
                }
            }
        }
    }
    out
}

/// Parse KVT4 text into a [`FactSet`] against a rule bundle.
///
/// - comment lines (`#`) and malformed lines are dropped
/// - PROBLEMS/SYMPTOMS keyword prefixes are stripped; aggregate PROBLEMS
///   lines (`Discharge Dx=CHF; COPD`) expand to per-item facts
/// - keywords typed `range` in the bundle must parse numerically, `mixed`
///   keeps the string on parse failure
/// - numeric values get a plausibility check; implausible values stay in the
///   set but are skipped by every scorer
/// - objective clusters keep only the first record per `(cluster, keyword)`
pub fn parse_kvt4(text: &str, rules: &RuleBundle) -> FactSet {
    let mut facts = FactSet::default();
    let mut seen_objective: HashSet<(Cluster, String)> = HashSet::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        if parts.len() != 4 {
            facts.n_dropped += 1;
            continue;
        }

        let cluster = match parts[0].parse::<Cluster>() {
            Ok(c) => c,
            Err(_) => {
                facts.n_dropped += 1;
                continue;
            }
        };
        let mut keyword = parts[1].to_string();
        let value = parts[2].to_string();
        let timestamp = parts[3].to_string();

        match cluster {
            Cluster::Problems => keyword = strip_prefixes(&keyword, &PROBLEM_PREFIXES),
            Cluster::Symptoms => keyword = strip_prefixes(&keyword, &SYMPTOM_PREFIXES),
            _ => {}
        }

        // Aggregate semantic lines expand into per-item facts so the scorer
        // tolerates drift like `PROBLEMS|Discharge Dx|CHF; COPD|Discharge`.
        if cluster == Cluster::Problems {
            let kw_cf = keyword.to_lowercase();
            let acute = ["discharge dx", "working dx", "complication", "complications"];
            let chronic = ["pmh/comorbidities", "pmh", "comorbidities", "past medical history"];
            let items = split_semantic_items(&value);
            if acute.contains(&kw_cf.as_str()) && !items.is_empty() {
                for it in items {
                    facts.push(ParsedFact {
                        cluster: Cluster::Problems,
                        keyword: it,
                        value: FactValue::Text("acute".into()),
                        timestamp: "Discharge".into(),
                        plausibility_ok: true,
                    });
                }
                continue;
            }
            if chronic.contains(&kw_cf.as_str()) && !items.is_empty() {
                for it in items {
                    facts.push(ParsedFact {
                        cluster: Cluster::Problems,
                        keyword: it,
                        value: FactValue::Text("chronic".into()),
                        timestamp: "Past".into(),
                        plausibility_ok: true,
                    });
                }
                continue;
            }
        }

        let kw_rule = rules.keyword_rule(cluster.name(), &keyword);
        let kw_kind = kw_rule.map(|r| r.kind);

        let parsed_value = if cluster.is_numeric() || kw_kind == Some(RuleKind::Range) {
            match try_parse_number(&value) {
                Some(v) => FactValue::Number(v),
                None => {
                    facts.n_dropped += 1;
                    continue;
                }
            }
        } else if kw_kind == Some(RuleKind::Mixed) {
            match try_parse_number(&value) {
                Some(v) => FactValue::Number(v),
                None => FactValue::Text(value.clone()),
            }
        } else {
            FactValue::Text(value.clone())
        };

        let plausibility_ok = match (&parsed_value, kw_rule.and_then(|r| r.plausibility)) {
            (FactValue::Number(v), Some(bounds)) => bounds.contains(*v),
            _ => true,
        };

        if cluster.is_objective() {
            let key = (cluster, keyword.clone());
            if seen_objective.contains(&key) {
                facts.n_dropped += 1;
                continue;
            }
            seen_objective.insert(key);
        }

        facts.push(ParsedFact {
            cluster,
            keyword,
            value: parsed_value,
            timestamp,
            plausibility_ok,
        });
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleBundle;
    use serde_json::json;

    fn bundle() -> RuleBundle {
        serde_json::from_value(json!({
            "_meta": {
                "calibration": {"alpha": -2.3475, "beta": 0.017},
                "risk_categories": []
            },
            "DAYS_PREDICTION": {
                "models": {
                    "regression": {"parameters": {"D_max": 30.0, "gamma": 0.03}},
                    "survival": {"parameters": {"k_base": 1.0}}
                }
            },
            "VITALS": {"keywords": {
                "Heart Rate": {"type": "range", "ranges": [], "plausibility": {"min": 20.0, "max": 300.0}}
            }},
            "MEDICATIONS": {"keywords": {
                "Medication Count": {"type": "range", "ranges": []},
                "Anticoagulation": {"type": "categorical", "values": {"yes": 2, "no": 0}}
            }},
            "PROCEDURES": {"keywords": {
                "Mechanical Ventilation": {"type": "mixed", "score_if_any_positive": 6}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_numeric_cluster_requires_number() {
        let f = parse_kvt4("VITALS|Heart Rate|88|Admission\nVITALS|Heart Rate|rapid|Admission", &bundle());
        assert_eq!(f.cluster(Cluster::Vitals).len(), 1);
        assert_eq!(f.n_dropped, 1);
    }

    #[test]
    fn test_ratio_rejected() {
        let f = parse_kvt4("VITALS|Heart Rate|120/80|Admission", &bundle());
        assert_eq!(f.n_parsed, 0);
        assert_eq!(f.n_dropped, 1);
    }

    #[test]
    fn test_decorated_numeric_accepted() {
        let f = parse_kvt4("PROCEDURES|Mechanical Ventilation|3 days|Admission", &bundle());
        assert_eq!(
            f.cluster(Cluster::Procedures)[0].value.as_number(),
            Some(3.0)
        );
    }

    #[test]
    fn test_plausibility_flag() {
        let f = parse_kvt4("VITALS|Heart Rate|999|Admission", &bundle());
        assert!(!f.cluster(Cluster::Vitals)[0].plausibility_ok);
    }

    #[test]
    fn test_objective_dedup_first_wins() {
        let f = parse_kvt4(
            "VITALS|Heart Rate|72|Discharge\nVITALS|Heart Rate|88|Admission",
            &bundle(),
        );
        assert_eq!(f.cluster(Cluster::Vitals).len(), 1);
        assert_eq!(f.number(Cluster::Vitals, "Heart Rate"), Some(72.0));
    }

    #[test]
    fn test_aggregate_problem_expansion() {
        let f = parse_kvt4("PROBLEMS|Discharge Dx|CHF; COPD exacerbation|Discharge", &bundle());
        let probs = f.cluster(Cluster::Problems);
        assert_eq!(probs.len(), 2);
        assert!(probs.iter().all(|p| p.value.as_key() == "acute"));
        assert!(probs.iter().all(|p| p.timestamp == "Discharge"));
    }

    #[test]
    fn test_prefix_stripping() {
        let f = parse_kvt4("PROBLEMS|PMH: Diabetes|chronic|Past", &bundle());
        assert_eq!(f.cluster(Cluster::Problems)[0].keyword, "Diabetes");
    }

    #[test]
    fn test_comments_and_malformed_skipped() {
        let f = parse_kvt4("# header\nnot a fact\nSYMPTOMS|Dizziness|yes|Admission", &bundle());
        assert_eq!(f.n_parsed, 1);
        assert_eq!(f.n_dropped, 1);
    }
}
