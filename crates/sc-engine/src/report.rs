//! Risk result payload and human-readable report rendering.

use sc_core::Cluster;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterScore {
    pub cluster: Cluster,
    pub score: i64,
    pub max_score: i64,
    pub contributing_factors: Vec<String>,
}

impl ClusterScore {
    pub fn new(cluster: Cluster, score: i64, max_score: i64, factors: Vec<String>) -> Self {
        Self {
            cluster,
            score,
            max_score,
            contributing_factors: factors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionResult {
    pub pattern_id: String,
    pub pattern_name: String,
    pub bonus: i64,
    pub description: String,
}

/// P(readmit by day t) at fixed horizons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalCurve {
    pub horizons: BTreeMap<u32, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResult {
    // Scores
    pub composite_score: i64,
    pub cluster_scores: BTreeMap<String, ClusterScore>,
    pub interaction_bonus: i64,
    pub interactions_triggered: Vec<InteractionResult>,

    // Risk classification
    pub probability: f64,
    pub risk_category: String,
    pub risk_color: String,

    // Days prediction
    pub estimated_days: f64,
    pub days_bucket: String,
    pub survival_curve: SurvivalCurve,

    // Explainability
    pub risk_factors: Vec<String>,
    pub protective_factors: Vec<String>,
    pub missing_clusters: Vec<String>,
    pub data_completeness: f64,
    pub confidence: String,

    // Raw data
    pub n_facts_parsed: usize,
    pub n_facts_dropped: usize,
}

/// Render a result as the plain-text risk report.
pub fn format_report(result: &RiskResult, hadm_id: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    let header = match hadm_id {
        Some(id) => format!("=== Readmission Risk Report (hadm_id: {id}) ==="),
        None => "=== Readmission Risk Report ===".to_string(),
    };
    lines.push(header);
    lines.push(String::new());

    lines.push(format!("RISK: {} ({})", result.risk_category, result.risk_color));
    lines.push(format!(
        "Probability of 30-day readmission: {:.1}%",
        result.probability * 100.0
    ));
    lines.push(format!("Composite score: {}", result.composite_score));
    lines.push(format!(
        "Confidence: {} (data completeness: {:.0}%)",
        result.confidence,
        result.data_completeness * 100.0
    ));
    lines.push(String::new());

    lines.push("--- Days-to-Readmission Prediction ---".to_string());
    lines.push(format!("Point estimate: ~{:.0} days", result.estimated_days));
    lines.push(format!("Bucket: {}", result.days_bucket));
    lines.push("Survival curve:".to_string());
    for (t, p) in &result.survival_curve.horizons {
        lines.push(format!("  P(readmit by day {t:2}): {:.1}%", p * 100.0));
    }
    lines.push(String::new());

    lines.push("--- Cluster Scores ---".to_string());
    for cluster in Cluster::ALL {
        if let Some(cs) = result.cluster_scores.get(cluster.name()) {
            lines.push(format!("  {}: {}/{}", cluster.name(), cs.score, cs.max_score));
        }
    }
    lines.push(format!("  INTERACTIONS: +{}", result.interaction_bonus));
    lines.push(format!("  TOTAL: {}", result.composite_score));
    lines.push(String::new());

    if !result.risk_factors.is_empty() {
        lines.push("--- Risk Factors ---".to_string());
        for rf in &result.risk_factors {
            lines.push(format!("  - {rf}"));
        }
        lines.push(String::new());
    }

    if !result.protective_factors.is_empty() {
        lines.push("--- Protective Factors ---".to_string());
        for pf in &result.protective_factors {
            lines.push(format!("  + {pf}"));
        }
        lines.push(String::new());
    }

    if !result.interactions_triggered.is_empty() {
        lines.push("--- Clinical Patterns Detected ---".to_string());
        for ix in &result.interactions_triggered {
            lines.push(format!("  [{}] {}: +{} pts", ix.pattern_id, ix.pattern_name, ix.bonus));
            lines.push(format!("    Evidence: {}", ix.description));
        }
        lines.push(String::new());
    }

    if !result.missing_clusters.is_empty() {
        lines.push(format!(
            "--- Missing Data ({} clusters) ---",
            result.missing_clusters.len()
        ));
        for mc in &result.missing_clusters {
            lines.push(format!("  ? {mc}"));
        }
        lines.push(String::new());
    }

    lines.push(format!(
        "Facts parsed: {}, dropped: {}",
        result.n_facts_parsed, result.n_facts_dropped
    ));

    lines.join("\n")
}
