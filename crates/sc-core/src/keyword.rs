//! Canonical keyword tables and lookup indexes.

use crate::cluster::Cluster;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Canonical VITALS keys in rendering order.
pub const VITALS_ORDER: [&str; 7] = [
    "Heart Rate",
    "Systolic BP",
    "Diastolic BP",
    "Respiratory Rate",
    "Temperature",
    "SpO2",
    "Weight",
];

/// Canonical LABS keys in rendering order.
pub const LABS_ORDER: [&str; 10] = [
    "Hemoglobin",
    "Hematocrit",
    "WBC",
    "Platelet",
    "Sodium",
    "Potassium",
    "Creatinine",
    "BUN",
    "Glucose",
    "Bicarbonate",
];

pub const DEMOGRAPHICS_KEYS: [&str; 2] = ["Sex", "Age"];

pub const UTILIZATION_KEYS: [&str; 4] = [
    "Prior Admissions 12mo",
    "ED Visits 6mo",
    "Days Since Last Admission",
    "Current Length of Stay",
];

pub const DISPOSITION_KEYS: [&str; 2] = ["Discharge Disposition", "Mental Status"];

pub const MEDICATIONS_KEYS: [&str; 7] = [
    "Medication Count",
    "New Medications Count",
    "Polypharmacy",
    "Anticoagulation",
    "Insulin Therapy",
    "Opioid Therapy",
    "Diuretic Therapy",
];

pub const PROCEDURES_KEYS: [&str; 4] = [
    "Any Procedure",
    "Surgery",
    "Dialysis",
    "Mechanical Ventilation",
];

/// Canonical keywords for a cluster. PROBLEMS/SYMPTOMS are open-vocabulary
/// and return an empty slice.
pub fn canonical_keywords(cluster: Cluster) -> &'static [&'static str] {
    match cluster {
        Cluster::Vitals => &VITALS_ORDER,
        Cluster::Labs => &LABS_ORDER,
        Cluster::Demographics => &DEMOGRAPHICS_KEYS,
        Cluster::Utilization => &UTILIZATION_KEYS,
        Cluster::Disposition => &DISPOSITION_KEYS,
        Cluster::Medications => &MEDICATIONS_KEYS,
        Cluster::Procedures => &PROCEDURES_KEYS,
        Cluster::Problems | Cluster::Symptoms => &[],
    }
}

static KEYWORD_TO_CLUSTER: Lazy<HashMap<&'static str, Cluster>> = Lazy::new(|| {
    let mut idx = HashMap::new();
    for cluster in Cluster::ALL {
        for kw in canonical_keywords(cluster) {
            idx.insert(*kw, cluster);
        }
    }
    idx
});

/// Reverse lookup used by 3-field line recovery and cluster-prefix repair.
pub fn cluster_for_keyword(keyword: &str) -> Option<Cluster> {
    KEYWORD_TO_CLUSTER.get(keyword.trim()).copied()
}

/// Lowercase alias → canonical lab key. Keys are in sparse-normalized form
/// (see [`normalize_sparse_key`]).
static LAB_KEY_ALIAS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("wbc", "WBC"),
        ("white blood cell", "WBC"),
        ("hemoglobin", "Hemoglobin"),
        ("hgb", "Hemoglobin"),
        ("hematocrit", "Hematocrit"),
        ("hct", "Hematocrit"),
        ("platelet", "Platelet"),
        ("plt", "Platelet"),
        ("sodium", "Sodium"),
        ("na", "Sodium"),
        ("potassium", "Potassium"),
        ("k", "Potassium"),
        ("creatinine", "Creatinine"),
        ("creat", "Creatinine"),
        ("bun", "BUN"),
        ("urea n", "BUN"),
        ("urean", "BUN"),
        ("blood urea nitrogen", "BUN"),
        ("glucose", "Glucose"),
        ("bicarbonate", "Bicarbonate"),
        ("hco3", "Bicarbonate"),
        ("bicarb", "Bicarbonate"),
        ("co2", "Bicarbonate"),
        ("total co2", "Bicarbonate"),
    ])
});

/// Collapse a key to lowercase alphanumeric words separated by single spaces.
pub fn normalize_sparse_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_space = true;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Map a lab key (possibly an alias like `Hgb` or `Urea N`) to its canonical
/// form, or return the input unchanged.
pub fn normalize_lab_key(key: &str) -> String {
    let normed = normalize_sparse_key(key);
    LAB_KEY_ALIAS
        .get(normed.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| key.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_counts_match_contract() {
        assert_eq!(canonical_keywords(Cluster::Vitals).len(), 7);
        assert_eq!(canonical_keywords(Cluster::Labs).len(), 10);
        assert_eq!(canonical_keywords(Cluster::Demographics).len(), 2);
        assert_eq!(canonical_keywords(Cluster::Utilization).len(), 4);
        assert_eq!(canonical_keywords(Cluster::Disposition).len(), 2);
        assert_eq!(canonical_keywords(Cluster::Medications).len(), 7);
        assert_eq!(canonical_keywords(Cluster::Procedures).len(), 4);
        assert!(canonical_keywords(Cluster::Problems).is_empty());
    }

    #[test]
    fn test_reverse_index() {
        assert_eq!(cluster_for_keyword("Heart Rate"), Some(Cluster::Vitals));
        assert_eq!(cluster_for_keyword("BUN"), Some(Cluster::Labs));
        assert_eq!(cluster_for_keyword("Polypharmacy"), Some(Cluster::Medications));
        assert_eq!(cluster_for_keyword("Dialysis"), Some(Cluster::Procedures));
        assert_eq!(cluster_for_keyword("Hypertension"), None);
    }

    #[test]
    fn test_lab_aliases() {
        assert_eq!(normalize_lab_key("Hgb"), "Hemoglobin");
        assert_eq!(normalize_lab_key("Urea N"), "BUN");
        assert_eq!(normalize_lab_key("UreaN"), "BUN");
        assert_eq!(normalize_lab_key("Total CO2"), "Bicarbonate");
        assert_eq!(normalize_lab_key("Troponin"), "Troponin");
    }

    #[test]
    fn test_sparse_key_normalization() {
        assert_eq!(normalize_sparse_key("Urea-N"), "urea n");
        assert_eq!(normalize_sparse_key("  Total   CO2 "), "total co2");
        assert_eq!(normalize_sparse_key("heart_rate"), "heart rate");
    }
}
