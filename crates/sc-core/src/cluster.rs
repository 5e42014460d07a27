//! The closed set of nine clinical clusters.

use crate::error::CoreError;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the nine closed clinical categories a fact can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Cluster {
    Demographics,
    Vitals,
    Labs,
    Problems,
    Symptoms,
    Medications,
    Procedures,
    Utilization,
    Disposition,
}

impl Cluster {
    /// All clusters in canonical rendering order.
    pub const ALL: [Cluster; 9] = [
        Cluster::Demographics,
        Cluster::Vitals,
        Cluster::Labs,
        Cluster::Problems,
        Cluster::Symptoms,
        Cluster::Medications,
        Cluster::Procedures,
        Cluster::Utilization,
        Cluster::Disposition,
    ];

    /// Uppercase wire name (`VITALS`, `LABS`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Cluster::Demographics => "DEMOGRAPHICS",
            Cluster::Vitals => "VITALS",
            Cluster::Labs => "LABS",
            Cluster::Problems => "PROBLEMS",
            Cluster::Symptoms => "SYMPTOMS",
            Cluster::Medications => "MEDICATIONS",
            Cluster::Procedures => "PROCEDURES",
            Cluster::Utilization => "UTILIZATION",
            Cluster::Disposition => "DISPOSITION",
        }
    }

    /// Values must be numeric-only after sanitation.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Cluster::Vitals | Cluster::Labs | Cluster::Utilization)
    }

    /// At most one record per `(cluster, keyword)` after normalization.
    pub fn is_objective(&self) -> bool {
        matches!(
            self,
            Cluster::Demographics
                | Cluster::Vitals
                | Cluster::Labs
                | Cluster::Utilization
                | Cluster::Disposition
        )
    }

    /// Open-vocabulary or multi-timestamp clusters.
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            Cluster::Problems | Cluster::Symptoms | Cluster::Medications | Cluster::Procedures
        )
    }

    /// Policy-default timestamp used when objective dedup canonicalizes.
    pub fn canonical_timestamp(&self) -> Timestamp {
        match self {
            Cluster::Disposition => Timestamp::Discharge,
            Cluster::Utilization => Timestamp::Past,
            _ => Timestamp::Admission,
        }
    }

    /// Parse a cluster token, tolerating markdown bold/angle wrappers
    /// (`*DEMOGRAPHICS**`, `<LABS>`) that small models sometimes emit.
    pub fn parse_loose(token: &str) -> Option<Cluster> {
        let t = token
            .trim()
            .trim_matches(|c| c == '*' || c == '<' || c == '>')
            .trim();
        t.to_uppercase().parse().ok()
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cluster {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEMOGRAPHICS" => Ok(Cluster::Demographics),
            "VITALS" => Ok(Cluster::Vitals),
            "LABS" => Ok(Cluster::Labs),
            "PROBLEMS" => Ok(Cluster::Problems),
            "SYMPTOMS" => Ok(Cluster::Symptoms),
            "MEDICATIONS" => Ok(Cluster::Medications),
            "PROCEDURES" => Ok(Cluster::Procedures),
            "UTILIZATION" => Ok(Cluster::Utilization),
            "DISPOSITION" => Ok(Cluster::Disposition),
            other => Err(CoreError::UnknownCluster(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions() {
        assert!(Cluster::Vitals.is_numeric());
        assert!(Cluster::Utilization.is_numeric());
        assert!(!Cluster::Problems.is_numeric());

        assert!(Cluster::Disposition.is_objective());
        assert!(!Cluster::Symptoms.is_objective());

        assert!(Cluster::Medications.is_semantic());
        assert!(!Cluster::Labs.is_semantic());
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("vitals".parse::<Cluster>().unwrap(), Cluster::Vitals);
        assert_eq!(" LABS ".parse::<Cluster>().unwrap(), Cluster::Labs);
        assert!("VITAL".parse::<Cluster>().is_err());
    }

    #[test]
    fn test_parse_loose_strips_wrappers() {
        assert_eq!(Cluster::parse_loose("*DEMOGRAPHICS**"), Some(Cluster::Demographics));
        assert_eq!(Cluster::parse_loose("<LABS>"), Some(Cluster::Labs));
        assert_eq!(Cluster::parse_loose("prose line"), None);
    }

    #[test]
    fn test_canonical_timestamps() {
        assert_eq!(Cluster::Disposition.canonical_timestamp(), Timestamp::Discharge);
        assert_eq!(Cluster::Utilization.canonical_timestamp(), Timestamp::Past);
        assert_eq!(Cluster::Vitals.canonical_timestamp(), Timestamp::Admission);
    }
}
