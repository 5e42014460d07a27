//! External scoring-rule bundle model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error reading rule bundle: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error in rule bundle: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Rule bundle missing cluster rules: {0}")]
    MissingClusterRules(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Numeric range with an attached score and human-readable label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRule {
    pub min: f64,
    pub max: f64,
    pub score: i64,
    #[serde(default)]
    pub label: String,
}

/// Inclusive plausibility bounds; out-of-range values do not score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn contains(&self, v: f64) -> bool {
        self.min <= v && v <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Range,
    Categorical,
    /// Numeric when it parses, categorical otherwise (Mechanical Ventilation).
    Mixed,
    /// Plausibility-checked but never scored directly (Weight).
    NoDirectScore,
}

/// Scoring rule for a single canonical keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub ranges: Vec<RangeRule>,
    #[serde(default)]
    pub values: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plausibility: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_if_any_positive: Option<i64>,
}

impl KeywordRule {
    /// Score a numeric value against the range table: `(score, label)`.
    pub fn score_range(&self, value: f64) -> (i64, &str) {
        for r in &self.ranges {
            if r.min <= value && value <= r.max {
                return (r.score, r.label.as_str());
            }
        }
        (0, "")
    }

    /// Categorical lookup: exact key first, then case-insensitive.
    pub fn score_value(&self, value: &str) -> i64 {
        if let Some(s) = self.values.get(value) {
            return *s;
        }
        let lower = value.to_lowercase();
        self.values
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, s)| *s)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRules {
    #[serde(default)]
    pub keywords: HashMap<String, KeywordRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    pub alpha: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCategory {
    pub name: String,
    pub color: String,
    pub score_min: i64,
    pub score_max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub calibration: Calibration,
    pub risk_categories: Vec<RiskCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionParams {
    #[serde(rename = "D_max")]
    pub d_max: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalParams {
    pub k_base: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionModel {
    pub parameters: RegressionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalModel {
    pub parameters: SurvivalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaysModels {
    pub regression: RegressionModel,
    pub survival: SurvivalModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaysPrediction {
    pub models: DaysModels,
}

/// The full `scoring_rules.json` bundle: per-cluster keyword rules plus
/// calibration, category bands, and days-prediction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBundle {
    #[serde(rename = "_meta")]
    pub meta: BundleMeta,
    #[serde(rename = "DAYS_PREDICTION")]
    pub days_prediction: DaysPrediction,
    #[serde(flatten)]
    pub clusters: HashMap<String, ClusterRules>,
}

impl RuleBundle {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn cluster(&self, name: &str) -> EngineResult<&ClusterRules> {
        self.clusters
            .get(name)
            .ok_or_else(|| EngineError::MissingClusterRules(name.to_string()))
    }

    pub fn keyword_rule(&self, cluster: &str, keyword: &str) -> Option<&KeywordRule> {
        self.clusters.get(cluster)?.keywords.get(keyword)
    }
}

/// One SNOMED-style concept group (problems) or urgency group (symptoms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptGroup {
    pub id: String,
    pub name: String,
    pub risk_weight: f64,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptGroupFile {
    pub groups: Vec<ConceptGroup>,
}

impl ConceptGroupFile {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bundle_deserializes() {
        let bundle: RuleBundle = serde_json::from_value(json!({
            "_meta": {
                "calibration": {"alpha": -2.3475, "beta": 0.017},
                "risk_categories": [
                    {"name": "Low", "color": "green", "score_min": 0, "score_max": 19}
                ]
            },
            "DAYS_PREDICTION": {
                "models": {
                    "regression": {"parameters": {"D_max": 30.0, "gamma": 0.03}},
                    "survival": {"parameters": {"k_base": 1.0}}
                }
            },
            "VITALS": {
                "keywords": {
                    "Heart Rate": {
                        "type": "range",
                        "ranges": [{"min": 101.0, "max": 120.0, "score": 2, "label": "tachycardia"}],
                        "plausibility": {"min": 20.0, "max": 300.0}
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(bundle.meta.calibration.beta, 0.017);
        assert_eq!(bundle.days_prediction.models.regression.parameters.d_max, 30.0);
        let rule = bundle.keyword_rule("VITALS", "Heart Rate").unwrap();
        assert_eq!(rule.score_range(110.0), (2, "tachycardia"));
        assert_eq!(rule.score_range(80.0), (0, ""));
        assert!(rule.plausibility.unwrap().contains(110.0));
    }

    #[test]
    fn test_categorical_lookup_case_insensitive() {
        let rule: KeywordRule = serde_json::from_value(json!({
            "type": "categorical",
            "values": {"Home": 0, "SNF": 4, "AMA": 6}
        }))
        .unwrap();
        assert_eq!(rule.score_value("SNF"), 4);
        assert_eq!(rule.score_value("snf"), 4);
        assert_eq!(rule.score_value("elsewhere"), 0);
    }
}
