//! The risk engine: rule bundles in, risk reports out.

use crate::concepts::ConceptIndex;
use crate::interactions::detect_interactions;
use crate::parse::{parse_kvt4, FactSet};
use crate::predict::{classify_risk, logistic, predict_bucket, predict_days, predict_survival};
use crate::report::{ClusterScore, RiskResult};
use crate::rules::{ClusterRules, ConceptGroupFile, EngineResult, RuleBundle};
use crate::scorers::SCORERS;
use once_cell::sync::Lazy;
use sc_core::Cluster;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

static EMPTY_CLUSTER_RULES: Lazy<ClusterRules> = Lazy::new(ClusterRules::default);

/// Deterministic scoring engine. Construct once per process from the config
/// bundles and pass by reference; every call is stateless.
pub struct RiskEngine {
    rules: RuleBundle,
    problem_index: ConceptIndex,
    symptom_index: ConceptIndex,
}

impl RiskEngine {
    pub fn new(
        rules: RuleBundle,
        problem_groups: ConceptGroupFile,
        symptom_groups: ConceptGroupFile,
    ) -> Self {
        Self {
            rules,
            problem_index: ConceptIndex::new(problem_groups.groups),
            symptom_index: ConceptIndex::new(symptom_groups.groups),
        }
    }

    /// Load `scoring_rules.json`, `snomed_problem_groups.json`, and
    /// `symptom_urgency_groups.json` from a config directory.
    pub fn from_config_dir(dir: &Path) -> EngineResult<Self> {
        let rules = RuleBundle::load(&dir.join("scoring_rules.json"))?;
        let problems = ConceptGroupFile::load(&dir.join("snomed_problem_groups.json"))?;
        let symptoms = ConceptGroupFile::load(&dir.join("symptom_urgency_groups.json"))?;
        tracing::debug!(
            "rule bundles loaded: {} clusters, {} problem groups, {} symptom groups",
            rules.clusters.len(),
            problems.groups.len(),
            symptoms.groups.len()
        );
        Ok(Self::new(rules, problems, symptoms))
    }

    pub fn rules(&self) -> &RuleBundle {
        &self.rules
    }

    pub fn problem_index(&self) -> &ConceptIndex {
        &self.problem_index
    }

    pub fn symptom_index(&self) -> &ConceptIndex {
        &self.symptom_index
    }

    pub(crate) fn cluster_rules(&self, cluster: Cluster) -> &ClusterRules {
        self.rules
            .clusters
            .get(cluster.name())
            .unwrap_or(&EMPTY_CLUSTER_RULES)
    }

    /// Score a parsed fact set.
    pub fn score_facts(&self, facts: &FactSet) -> RiskResult {
        let mut cluster_scores: BTreeMap<String, ClusterScore> = BTreeMap::new();
        for (cluster, scorer, cap, max_score) in SCORERS {
            let mut cs = scorer(self, facts.cluster(cluster));
            if cap {
                cs.score = cs.score.min(max_score);
            }
            cluster_scores.insert(cluster.name().to_string(), cs);
        }

        let interactions = detect_interactions(self, facts);
        let interaction_bonus: i64 = interactions.iter().map(|i| i.bonus).sum();

        let composite: i64 =
            cluster_scores.values().map(|cs| cs.score).sum::<i64>() + interaction_bonus;

        let cal = &self.rules.meta.calibration;
        let probability = logistic(cal.alpha, cal.beta, composite);
        let (category, color) = classify_risk(&self.rules.meta.risk_categories, composite);

        let reg = &self.rules.days_prediction.models.regression.parameters;
        let estimated_days = predict_days(reg.d_max, reg.gamma, composite);
        let bucket = predict_bucket(estimated_days);
        let k_base = self.rules.days_prediction.models.survival.parameters.k_base;
        let survival = predict_survival(k_base, composite, probability);

        let mut risk_factors: Vec<String> = Vec::new();
        let mut protective_factors: Vec<String> = Vec::new();
        for cluster in Cluster::ALL {
            if let Some(cs) = cluster_scores.get(cluster.name()) {
                risk_factors.extend(cs.contributing_factors.iter().cloned());
            }
        }

        // Normal values in the objective clusters count as protective signal
        // when data is actually present.
        for cluster in [Cluster::Vitals, Cluster::Labs] {
            if let Some(cs) = cluster_scores.get(cluster.name()) {
                if cs.score == 0 && facts.has_cluster(cluster) {
                    protective_factors
                        .push(format!("Normal {} at discharge", cluster.name().to_lowercase()));
                }
            }
        }
        if let Some(cs) = cluster_scores.get(Cluster::Disposition.name()) {
            if cs.score == 0 && facts.has_cluster(Cluster::Disposition) {
                protective_factors.push("Stable disposition (Home, alert)".to_string());
            }
        }

        for i in &interactions {
            risk_factors.push(format!("[PATTERN] {} (+{})", i.pattern_name, i.bonus));
        }

        let mut missing_clusters: Vec<String> = facts
            .missing_clusters()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        missing_clusters.sort();
        let completeness = 1.0 - missing_clusters.len() as f64 / Cluster::ALL.len() as f64;
        let confidence = if completeness >= 0.7 {
            "high"
        } else if completeness >= 0.5 {
            "medium"
        } else {
            "low"
        };

        RiskResult {
            composite_score: composite,
            cluster_scores,
            interaction_bonus,
            interactions_triggered: interactions,
            probability: (probability * 10_000.0).round() / 10_000.0,
            risk_category: category,
            risk_color: color,
            estimated_days: (estimated_days * 10.0).round() / 10.0,
            days_bucket: bucket.to_string(),
            survival_curve: survival,
            risk_factors,
            protective_factors,
            missing_clusters,
            data_completeness: (completeness * 100.0).round() / 100.0,
            confidence: confidence.to_string(),
            n_facts_parsed: facts.n_parsed,
            n_facts_dropped: facts.n_dropped,
        }
    }

    /// Score raw KVT4 text.
    pub fn score_text(&self, kvt4_text: &str) -> RiskResult {
        let facts = parse_kvt4(kvt4_text, &self.rules);
        self.score_facts(&facts)
    }

    /// Score a KVT4 file.
    pub fn score_file(&self, path: &Path) -> EngineResult<RiskResult> {
        let text = std::fs::read_to_string(path)?;
        Ok(self.score_text(&text))
    }

    /// Score a JSONL corpus of `{hadm_id, completion}` rows.
    /// `limit` of 0 means all rows.
    pub fn score_jsonl(&self, path: &Path, limit: usize) -> EngineResult<Vec<(String, RiskResult)>> {
        let text = std::fs::read_to_string(path)?;
        let mut results = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if limit > 0 && i >= limit {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let obj: Value = serde_json::from_str(line)?;
            let hadm_id = obj
                .get("hadm_id")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| format!("row_{i}"));
            let completion = obj
                .get("completion")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !completion.is_empty() {
                results.push((hadm_id, self.score_text(completion)));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config")
    }

    fn engine() -> RiskEngine {
        RiskEngine::from_config_dir(&config_dir()).expect("config bundles load")
    }

    #[test]
    fn test_sepsis_pattern_triggers_with_bonus() {
        let e = engine();
        let text = "\
VITALS|Heart Rate|120|Admission
VITALS|Systolic BP|90|Admission
VITALS|Respiratory Rate|26|Admission
LABS|WBC|15|Admission
VITALS|Temperature|101|Admission";
        let result = e.score_text(text);
        let sepsis = result
            .interactions_triggered
            .iter()
            .find(|i| i.pattern_id == "sepsis_pattern")
            .expect("sepsis pattern triggered");
        assert_eq!(sepsis.bonus, 10);

        let cluster_sum: i64 = result.cluster_scores.values().map(|c| c.score).sum();
        assert!(result.composite_score >= cluster_sum + 10);
    }

    #[test]
    fn test_category_banding() {
        let e = engine();
        let (cat, _) = classify_risk(&e.rules().meta.risk_categories, 35);
        assert_eq!(cat, "Medium");
        let p = logistic(
            e.rules().meta.calibration.alpha,
            e.rules().meta.calibration.beta,
            35,
        );
        assert!((p - 0.145).abs() < 0.005);
    }

    #[test]
    fn test_monotone_risk_on_prior_admissions() {
        // Raising the prior-admissions count across a rule boundary never
        // decreases the composite score.
        let e = engine();
        let low = e.score_text("UTILIZATION|Prior Admissions 12mo|0|Past");
        let mid = e.score_text("UTILIZATION|Prior Admissions 12mo|2|Past");
        let high = e.score_text("UTILIZATION|Prior Admissions 12mo|5|Past");
        assert!(mid.composite_score >= low.composite_score);
        assert!(high.composite_score >= mid.composite_score);
        assert!(high.composite_score > low.composite_score);
    }

    #[test]
    fn test_empty_stream_low_completeness() {
        let e = engine();
        let result = e.score_text("");
        assert_eq!(result.n_facts_parsed, 0);
        assert_eq!(result.confidence, "low");
        assert_eq!(result.missing_clusters.len(), 9);
        assert!((0.0..=1.0).contains(&result.probability));
    }

    #[test]
    fn test_implausible_value_does_not_score() {
        let e = engine();
        let ok = e.score_text("VITALS|Heart Rate|130|Admission");
        let implausible = e.score_text("VITALS|Heart Rate|1300|Admission");
        let ok_vitals = &ok.cluster_scores["VITALS"];
        let bad_vitals = &implausible.cluster_scores["VITALS"];
        assert!(ok_vitals.score > 0);
        assert_eq!(bad_vitals.score, 0);
    }

    #[test]
    fn test_protective_factors_on_normal_values() {
        let e = engine();
        let result = e.score_text(
            "VITALS|Heart Rate|72|Discharge\nDISPOSITION|Discharge Disposition|Home|Discharge\nDISPOSITION|Mental Status|alert|Discharge",
        );
        assert!(result
            .protective_factors
            .iter()
            .any(|p| p.contains("Normal vitals")));
        assert!(result
            .protective_factors
            .iter()
            .any(|p| p.contains("Stable disposition")));
    }

    #[test]
    fn test_problems_multimorbidity_and_cap() {
        let e = engine();
        let text = "\
PROBLEMS|Heart Failure|chronic|Past
PROBLEMS|COPD|chronic|Past
PROBLEMS|Diabetes|chronic|Past
PROBLEMS|Chronic Kidney Disease|chronic|Past
PROBLEMS|Atrial Fibrillation|chronic|Past
PROBLEMS|Cirrhosis|chronic|Past";
        let result = e.score_text(text);
        let problems = &result.cluster_scores["PROBLEMS"];
        assert!(problems.score > 0);
        assert!(problems.score <= 40);
        assert!(problems
            .contributing_factors
            .iter()
            .any(|f| f.contains("Multimorbidity")));
    }

    #[test]
    fn test_any_procedure_is_generic_fallback_only() {
        let e = engine();
        let with_specific = e.score_text(
            "PROCEDURES|Surgery|yes|Past\nPROCEDURES|Any Procedure|yes|Admission",
        );
        let factors = &with_specific.cluster_scores["PROCEDURES"].contributing_factors;
        assert!(factors.iter().any(|f| f.contains("Surgery")));
        assert!(!factors.iter().any(|f| f.contains("generic fallback")));

        let generic_only = e.score_text("PROCEDURES|Any Procedure|yes|Admission");
        let factors = &generic_only.cluster_scores["PROCEDURES"].contributing_factors;
        assert!(factors.iter().any(|f| f.contains("generic fallback")));
    }

    #[test]
    fn test_report_renders() {
        let e = engine();
        let result = e.score_text("VITALS|Heart Rate|120|Admission");
        let report = crate::report::format_report(&result, Some("12345"));
        assert!(report.contains("Readmission Risk Report"));
        assert!(report.contains("hadm_id: 12345"));
        assert!(report.contains("Composite score:"));
    }
}
