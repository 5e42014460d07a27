//! The Stage-1 domain digest: a fixed nine-key summary of one note.

use crate::cluster::Cluster;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Structured PROBLEMS payload (sgr_v2 and later profiles).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemsBlock {
    #[serde(default)]
    pub pmh_comorbidities: Vec<String>,
    #[serde(default)]
    pub discharge_dx: Vec<String>,
    #[serde(default)]
    pub complications: Vec<String>,
    #[serde(default)]
    pub working_dx: Vec<String>,
}

/// Structured SYMPTOMS payload (sgr_v2 and later profiles).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymptomsBlock {
    #[serde(default)]
    pub admission: Vec<String>,
    #[serde(default)]
    pub discharge: Vec<String>,
}

/// Structured objective payload (sgr_v4 VITALS/LABS, DEMOGRAPHICS objects).
/// Keys are model-provided and normalized later; values are raw strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectiveBlock {
    #[serde(default)]
    pub admission: BTreeMap<String, String>,
    #[serde(default)]
    pub discharge: BTreeMap<String, String>,
}

/// One cluster's value inside the digest. The Stage-1 profile decides which
/// shape the model produces; renderers and sanitizers match on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterValue {
    Problems(ProblemsBlock),
    Symptoms(SymptomsBlock),
    Objective(ObjectiveBlock),
    Text(String),
}

impl Default for ClusterValue {
    fn default() -> Self {
        ClusterValue::Text(String::new())
    }
}

impl ClusterValue {
    /// Flatten to display text. Structured variants re-serialize; callers
    /// that care about structure should match instead.
    pub fn as_text(&self) -> String {
        match self {
            ClusterValue::Text(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ClusterValue::Text(s) => s.trim().is_empty(),
            ClusterValue::Problems(p) => {
                p.pmh_comorbidities.is_empty()
                    && p.discharge_dx.is_empty()
                    && p.complications.is_empty()
                    && p.working_dx.is_empty()
            }
            ClusterValue::Symptoms(s) => s.admission.is_empty() && s.discharge.is_empty(),
            ClusterValue::Objective(o) => o.admission.is_empty() && o.discharge.is_empty(),
        }
    }
}

/// The nine-key Stage-1 summary. Missing keys deserialize as empty text so
/// key presence can be gated separately by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    #[serde(rename = "DEMOGRAPHICS", default)]
    pub demographics: ClusterValue,
    #[serde(rename = "VITALS", default)]
    pub vitals: ClusterValue,
    #[serde(rename = "LABS", default)]
    pub labs: ClusterValue,
    #[serde(rename = "PROBLEMS", default)]
    pub problems: ClusterValue,
    #[serde(rename = "SYMPTOMS", default)]
    pub symptoms: ClusterValue,
    #[serde(rename = "MEDICATIONS", default)]
    pub medications: ClusterValue,
    #[serde(rename = "PROCEDURES", default)]
    pub procedures: ClusterValue,
    #[serde(rename = "UTILIZATION", default)]
    pub utilization: ClusterValue,
    #[serde(rename = "DISPOSITION", default)]
    pub disposition: ClusterValue,
}

impl Digest {
    pub fn get(&self, cluster: Cluster) -> &ClusterValue {
        match cluster {
            Cluster::Demographics => &self.demographics,
            Cluster::Vitals => &self.vitals,
            Cluster::Labs => &self.labs,
            Cluster::Problems => &self.problems,
            Cluster::Symptoms => &self.symptoms,
            Cluster::Medications => &self.medications,
            Cluster::Procedures => &self.procedures,
            Cluster::Utilization => &self.utilization,
            Cluster::Disposition => &self.disposition,
        }
    }

    pub fn get_mut(&mut self, cluster: Cluster) -> &mut ClusterValue {
        match cluster {
            Cluster::Demographics => &mut self.demographics,
            Cluster::Vitals => &mut self.vitals,
            Cluster::Labs => &mut self.labs,
            Cluster::Problems => &mut self.problems,
            Cluster::Symptoms => &mut self.symptoms,
            Cluster::Medications => &mut self.medications,
            Cluster::Procedures => &mut self.procedures,
            Cluster::Utilization => &mut self.utilization,
            Cluster::Disposition => &mut self.disposition,
        }
    }

    /// Build from an extracted JSON object, keeping only the nine cluster
    /// keys. Returns the digest plus the list of missing top-level keys.
    pub fn from_json(obj: &Value) -> (Digest, Vec<String>) {
        let mut digest = Digest::default();
        let mut missing = Vec::new();
        let map = match obj.as_object() {
            Some(m) => m,
            None => {
                return (
                    digest,
                    Cluster::ALL.iter().map(|c| c.name().to_string()).collect(),
                )
            }
        };
        for cluster in Cluster::ALL {
            match map.get(cluster.name()) {
                Some(v) => {
                    let value = serde_json::from_value::<ClusterValue>(v.clone())
                        .unwrap_or_else(|_| ClusterValue::Text(stringify_loose(v)));
                    *digest.get_mut(cluster) = value;
                }
                None => missing.push(cluster.name().to_string()),
            }
        }
        (digest, missing)
    }
}

/// Render a non-string JSON value as display text without quotes.
fn stringify_loose(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_string_clusters() {
        let obj = json!({
            "DEMOGRAPHICS": "Sex=female\nAge=72",
            "VITALS": "ADM: Heart Rate=88",
            "LABS": "not stated",
            "PROBLEMS": {"pmh_comorbidities": ["Hypertension"], "discharge_dx": [],
                          "complications": [], "working_dx": []},
            "SYMPTOMS": {"admission": ["dizziness"], "discharge": []},
            "MEDICATIONS": "Anticoagulation=yes",
            "PROCEDURES": "",
            "UTILIZATION": "",
            "DISPOSITION": "Discharge Disposition=Home"
        });
        let (digest, missing) = Digest::from_json(&obj);
        assert!(missing.is_empty());
        match &digest.problems {
            ClusterValue::Problems(p) => assert_eq!(p.pmh_comorbidities, vec!["Hypertension"]),
            other => panic!("expected problems block, got {other:?}"),
        }
        match &digest.symptoms {
            ClusterValue::Symptoms(s) => assert_eq!(s.admission, vec!["dizziness"]),
            other => panic!("expected symptoms block, got {other:?}"),
        }
        assert_eq!(digest.demographics.as_text(), "Sex=female\nAge=72");
    }

    #[test]
    fn test_from_json_reports_missing_keys() {
        let obj = json!({"VITALS": "x"});
        let (_, missing) = Digest::from_json(&obj);
        assert_eq!(missing.len(), 8);
        assert!(missing.contains(&"DISPOSITION".to_string()));
    }

    #[test]
    fn test_objective_block_shape() {
        let obj = json!({
            "admission": {"heart_rate": "88", "spo2": "98% RA"},
            "discharge": {}
        });
        let v: ClusterValue = serde_json::from_value(obj).unwrap();
        match v {
            ClusterValue::Objective(o) => {
                assert_eq!(o.admission.get("heart_rate").map(String::as_str), Some("88"));
            }
            other => panic!("expected objective block, got {other:?}"),
        }
    }
}
