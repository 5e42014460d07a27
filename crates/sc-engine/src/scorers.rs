//! Per-cluster scorers.
//!
//! Each scorer has the shape `(engine, facts) -> ClusterScore`; dispatch goes
//! through [`SCORERS`], a table keyed by cluster with the cluster's score cap.

use crate::engine::RiskEngine;
use crate::parse::{FactValue, ParsedFact};
use crate::report::ClusterScore;
use sc_core::Cluster;
use std::collections::HashMap;

pub type Scorer = fn(&RiskEngine, &[ParsedFact]) -> ClusterScore;

/// Dispatch table: `(cluster, scorer, cap_at_max, max_score)`.
/// DEMOGRAPHICS/VITALS/LABS accumulate uncapped; the rest cap at max.
pub const SCORERS: [(Cluster, Scorer, bool, i64); 9] = [
    (Cluster::Demographics, score_demographics, false, 10),
    (Cluster::Vitals, score_vitals, false, 25),
    (Cluster::Labs, score_labs, false, 30),
    (Cluster::Problems, score_problems, true, 40),
    (Cluster::Symptoms, score_symptoms, true, 15),
    (Cluster::Medications, score_medications, true, 15),
    (Cluster::Procedures, score_procedures, true, 15),
    (Cluster::Utilization, score_utilization, true, 20),
    (Cluster::Disposition, score_disposition, true, 15),
];

fn score_demographics(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let rules = engine.cluster_rules(Cluster::Demographics);
    let mut score = 0i64;
    let mut factors: Vec<String> = Vec::new();
    let mut age_found = false;

    for f in facts {
        match f.keyword.as_str() {
            "Age" => {
                if let Some(v) = f.value.as_number() {
                    age_found = true;
                    if let Some(rule) = rules.keywords.get("Age") {
                        let (pts, label) = rule.score_range(v);
                        score += pts;
                        if pts > 0 {
                            factors.push(format!("Age {} ({label}, +{pts})", v as i64));
                        }
                    }
                }
            }
            "Sex" => {
                if let Some(rule) = rules.keywords.get("Sex") {
                    let val = f.value.as_key();
                    let pts = rule.score_value(&val);
                    score += pts;
                    if pts > 0 {
                        factors.push(format!("Sex={val} (+{pts})"));
                    }
                }
            }
            _ => {}
        }
    }

    if !age_found {
        let default = rules
            .keywords
            .get("Age")
            .and_then(|r| r.missing_score)
            .unwrap_or(2);
        score += default;
        factors.push(format!("Age missing (default +{default})"));
    }

    ClusterScore::new(Cluster::Demographics, score, 10, factors)
}

fn score_numeric_cluster(
    engine: &RiskEngine,
    cluster: Cluster,
    max_score: i64,
    facts: &[ParsedFact],
) -> ClusterScore {
    let rules = engine.cluster_rules(cluster);
    let mut score = 0i64;
    let mut factors: Vec<String> = Vec::new();

    for f in facts {
        if !f.plausibility_ok {
            continue;
        }
        let Some(v) = f.value.as_number() else { continue };
        let Some(rule) = rules.keywords.get(&f.keyword) else {
            continue;
        };
        if rule.kind == crate::rules::RuleKind::NoDirectScore {
            continue;
        }
        let (pts, label) = rule.score_range(v);
        score += pts;
        if pts > 0 {
            factors.push(format!("{}={} ({label}, +{pts})", f.keyword, f.value.as_text()));
        }
    }

    ClusterScore::new(cluster, score, max_score, factors)
}

fn score_vitals(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    score_numeric_cluster(engine, Cluster::Vitals, 25, facts)
}

fn score_labs(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    score_numeric_cluster(engine, Cluster::Labs, 30, facts)
}

const PROBLEM_ACTIVE_VALUES: [&str; 3] = ["chronic", "acute", "exist"];

fn score_problems(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let mut factors: Vec<String> = Vec::new();
    let mut active_groups: HashMap<String, f64> = HashMap::new();

    for f in facts {
        let val = f.value.as_key();
        if !PROBLEM_ACTIVE_VALUES.contains(&val.as_str()) {
            continue;
        }
        if let Some(group) = engine.problem_index().match_group(&f.keyword) {
            let entry = active_groups.entry(group.id.clone()).or_insert(0.0);
            if group.risk_weight > *entry {
                *entry = group.risk_weight;
                factors.push(format!(
                    "{} → {} (weight {})",
                    f.keyword, group.name, group.risk_weight
                ));
            }
        }
    }

    let base: f64 = active_groups.values().sum();

    // Multimorbidity bonus: one point per active group past the third, max 5.
    let n_groups = active_groups.len() as i64;
    let mm_bonus = if n_groups > 3 {
        let b = (n_groups - 3).min(5);
        factors.push(format!("Multimorbidity: {n_groups} groups (+{b})"));
        b
    } else {
        0
    };

    let score = (base.round() as i64 + mm_bonus).min(40);
    ClusterScore::new(Cluster::Problems, score, 40, factors)
}

fn symptom_multiplier(value: &str) -> f64 {
    match value {
        "severe" => 1.5,
        "yes" => 1.0,
        _ => 0.0,
    }
}

fn score_symptoms(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let mut factors: Vec<String> = Vec::new();
    let mut active_groups: HashMap<String, f64> = HashMap::new();
    let mut active_count = 0usize;

    for f in facts {
        let val = f.value.as_key();
        let mult = symptom_multiplier(&val);
        if mult == 0.0 {
            continue;
        }
        active_count += 1;
        if let Some(group) = engine.symptom_index().match_group(&f.keyword) {
            let w = group.risk_weight * mult;
            let entry = active_groups.entry(group.id.clone()).or_insert(0.0);
            if w > *entry {
                *entry = w;
                factors.push(format!("{}={val} → {} (+{w:.1})", f.keyword, group.name));
            }
        }
    }

    let base: f64 = active_groups.values().sum();
    let bonus = if active_count > 3 {
        factors.push(format!("Active symptoms: {active_count} (>3, +2)"));
        2.0
    } else {
        0.0
    };

    let score = ((base + bonus).round() as i64).min(15);
    ClusterScore::new(Cluster::Symptoms, score, 15, factors)
}

fn score_medications(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let rules = engine.cluster_rules(Cluster::Medications);
    let mut score = 0i64;
    let mut factors: Vec<String> = Vec::new();
    let mut med_count: Option<f64> = None;

    for f in facts {
        let Some(rule) = rules.keywords.get(&f.keyword) else {
            continue;
        };
        match rule.kind {
            crate::rules::RuleKind::Range => {
                if let Some(v) = f.value.as_number() {
                    let (pts, label) = rule.score_range(v);
                    score += pts;
                    if f.keyword == "Medication Count" {
                        med_count = Some(v);
                    }
                    if pts > 0 {
                        factors.push(format!(
                            "{}={} ({label}, +{pts})",
                            f.keyword,
                            f.value.as_text()
                        ));
                    }
                }
            }
            crate::rules::RuleKind::Categorical => {
                let val = f.value.as_key();
                let pts = rule.score_value(&val);
                score += pts;
                if pts > 0 {
                    factors.push(format!("{}={val} (+{pts})", f.keyword));
                }
            }
            _ => {}
        }
    }

    // Derived polypharmacy: five or more meds counts even when the explicit
    // Polypharmacy flag never scored.
    let polypharmacy_scored = factors.iter().any(|f| f.contains("Polypharmacy"));
    if let Some(mc) = med_count {
        if mc >= 5.0 && !polypharmacy_scored {
            score += 3;
            factors.push(format!("Derived Polypharmacy (Med Count={} >=5, +3)", mc as i64));
        }
    }

    ClusterScore::new(Cluster::Medications, score.min(15), 15, factors)
}

fn score_procedures(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let rules = engine.cluster_rules(Cluster::Procedures);
    let mut score = 0i64;
    let mut factors: Vec<String> = Vec::new();
    let mut specific_scored = false;

    for f in facts {
        let Some(rule) = rules.keywords.get(&f.keyword) else {
            continue;
        };
        match f.keyword.as_str() {
            "Mechanical Ventilation" => {
                let pts = rule.score_if_any_positive.unwrap_or(0);
                match &f.value {
                    FactValue::Number(days) if *days > 0.0 => {
                        score += pts;
                        factors.push(format!("Mechanical Ventilation={days} days (+{pts})"));
                        specific_scored = true;
                    }
                    FactValue::Text(s) if s.trim().to_lowercase() != "no" => {
                        score += pts;
                        factors.push(format!("Mechanical Ventilation={} (+{pts})", s.trim()));
                        specific_scored = true;
                    }
                    _ => {}
                }
            }
            "Dialysis" | "Surgery" => {
                let val = f.value.as_key();
                let pts = rule.score_value(&val);
                score += pts;
                if pts > 0 {
                    factors.push(format!("{}={val} (+{pts})", f.keyword));
                    specific_scored = true;
                }
            }
            _ => {}
        }
    }

    // Any Procedure only scores as a generic fallback when nothing specific did.
    if !specific_scored {
        if let Some(rule) = rules.keywords.get("Any Procedure") {
            if let Some(f) = facts.iter().find(|f| f.keyword == "Any Procedure") {
                let val = f.value.as_key();
                let pts = rule.score_value(&val);
                score += pts;
                if pts > 0 {
                    factors.push(format!("Any Procedure={val} (generic fallback, +{pts})"));
                }
            }
        }
    }

    ClusterScore::new(Cluster::Procedures, score.min(15), 15, factors)
}

fn score_utilization(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let mut cs = score_numeric_cluster(engine, Cluster::Utilization, 20, facts);
    cs.score = cs.score.min(20);
    cs
}

fn score_disposition(engine: &RiskEngine, facts: &[ParsedFact]) -> ClusterScore {
    let rules = engine.cluster_rules(Cluster::Disposition);
    let mut score = 0i64;
    let mut factors: Vec<String> = Vec::new();

    for f in facts {
        let Some(rule) = rules.keywords.get(&f.keyword) else {
            continue;
        };
        let raw = f.value.as_text();
        let val = match f.keyword.as_str() {
            "Discharge Disposition" => normalize_discharge_disposition(&raw),
            "Mental Status" => normalize_mental_status(&raw),
            _ => raw.trim().to_string(),
        };
        let pts = rule.score_value(&val);
        score += pts;
        if pts > 0 {
            factors.push(format!("{}={val} (+{pts})", f.keyword));
        }
    }

    ClusterScore::new(Cluster::Disposition, score.min(15), 15, factors)
}

/// Map common disposition variants onto the scoring allowlist.
pub fn normalize_discharge_disposition(value: &str) -> String {
    let v = value.trim();
    let v_cf = v.to_lowercase();
    match v_cf.as_str() {
        "home with service" | "home w service" | "home with svc" | "home w/ service"
        | "home with services" | "home w services" | "home w/ services" | "home health"
        | "home health care" => "Home with Services".to_string(),
        "hospice residence" | "hospice care" => "Hospice".to_string(),
        _ => v.to_string(),
    }
}

/// Map mental-status phrases onto the scoring allowlist.
pub fn normalize_mental_status(value: &str) -> String {
    let v = value.trim();
    let v_cf = v.to_lowercase();
    if v_cf.contains("alert") && v_cf.contains("orient") {
        return "alert".to_string();
    }
    match v_cf.as_str() {
        "a&o" | "ao" | "a/ox3" | "a/ox4" => "alert".to_string(),
        _ => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_normalization() {
        assert_eq!(normalize_discharge_disposition("home health"), "Home with Services");
        assert_eq!(normalize_discharge_disposition("Hospice Care"), "Hospice");
        assert_eq!(normalize_discharge_disposition("SNF"), "SNF");
    }

    #[test]
    fn test_mental_status_normalization() {
        assert_eq!(normalize_mental_status("alert and oriented x3"), "alert");
        assert_eq!(normalize_mental_status("A&O"), "alert");
        assert_eq!(normalize_mental_status("lethargic"), "lethargic");
    }

    #[test]
    fn test_symptom_multiplier() {
        assert_eq!(symptom_multiplier("severe"), 1.5);
        assert_eq!(symptom_multiplier("yes"), 1.0);
        assert_eq!(symptom_multiplier("no"), 0.0);
    }
}
