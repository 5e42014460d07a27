//! The KVT4 fact record.

use crate::cluster::Cluster;
use crate::error::CoreError;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single extracted fact: `(cluster, keyword, value, timestamp)`.
///
/// Serialized form is pipe-delimited with exactly three separators:
/// `VITALS|Heart Rate|88|Admission`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fact {
    pub cluster: Cluster,
    pub keyword: String,
    pub value: String,
    pub timestamp: Timestamp,
}

impl Fact {
    pub fn new(
        cluster: Cluster,
        keyword: impl Into<String>,
        value: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            cluster,
            keyword: keyword.into(),
            value: value.into(),
            timestamp,
        }
    }

    /// Objective dedup key.
    pub fn objective_key(&self) -> (Cluster, String) {
        (self.cluster, self.keyword.clone())
    }

    /// True when the value parses as a bare number (`^-?\d+(\.\d+)?$`).
    pub fn has_numeric_value(&self) -> bool {
        let v = self.value.trim();
        let v = v.strip_prefix('-').unwrap_or(v);
        if v.is_empty() {
            return false;
        }
        let mut dots = 0;
        for (i, c) in v.char_indices() {
            match c {
                '0'..='9' => {}
                '.' if i > 0 && i + 1 < v.len() => {
                    dots += 1;
                    if dots > 1 {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.cluster, self.keyword, self.value, self.timestamp
        )
    }
}

impl FromStr for Fact {
    type Err = CoreError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let ln = line.trim();
        if ln.matches('|').count() != 3 {
            return Err(CoreError::MalformedFact(ln.to_string()));
        }
        let parts: Vec<&str> = ln.split('|').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(CoreError::EmptyField(ln.to_string()));
        }
        Ok(Fact {
            cluster: parts[0].parse()?,
            keyword: parts[1].to_string(),
            value: parts[2].to_string(),
            timestamp: parts[3].parse()?,
        })
    }
}

/// Parse every well-formed fact line from a block of text, dropping the rest.
pub fn parse_fact_lines(text: &str) -> Vec<Fact> {
    text.lines()
        .filter_map(|ln| ln.trim().parse::<Fact>().ok())
        .collect()
}

/// Serialize facts back to a newline-terminated KVT4 block.
pub fn render_fact_lines(facts: &[Fact]) -> String {
    let mut out = String::new();
    for f in facts {
        out.push_str(&f.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_basic() {
        let f: Fact = "VITALS|Heart Rate|88|Admission".parse().unwrap();
        assert_eq!(f.cluster, Cluster::Vitals);
        assert_eq!(f.keyword, "Heart Rate");
        assert_eq!(f.value, "88");
        assert_eq!(f.timestamp, Timestamp::Admission);
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!("VITALS|Heart Rate|88".parse::<Fact>().is_err());
        assert!("VITALS|Heart Rate|88|Admission|extra".parse::<Fact>().is_err());
        assert!("VITALS||88|Admission".parse::<Fact>().is_err());
    }

    #[test]
    fn test_timestamp_alias_in_line() {
        let f: Fact = "LABS|WBC|7.7|ADM".parse().unwrap();
        assert_eq!(f.timestamp, Timestamp::Admission);
    }

    #[test]
    fn test_numeric_value_check() {
        let mut f: Fact = "LABS|WBC|7.7|Admission".parse().unwrap();
        assert!(f.has_numeric_value());
        f.value = "-12".into();
        assert!(f.has_numeric_value());
        f.value = "120/80".into();
        assert!(!f.has_numeric_value());
        f.value = "7.7.1".into();
        assert!(!f.has_numeric_value());
        f.value = "98%".into();
        assert!(!f.has_numeric_value());
    }

    fn arb_cluster() -> impl Strategy<Value = Cluster> {
        prop::sample::select(Cluster::ALL.to_vec())
    }

    fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        prop::sample::select(vec![
            Timestamp::Past,
            Timestamp::Admission,
            Timestamp::Discharge,
            Timestamp::Unknown,
        ])
    }

    proptest! {
        // For all well-formed records, parse(serialize(r)) == r.
        #[test]
        fn prop_roundtrip(
            cluster in arb_cluster(),
            keyword in "[A-Za-z][A-Za-z0-9 ]{0,30}",
            value in "[A-Za-z0-9.][A-Za-z0-9. ]{0,20}",
            timestamp in arb_timestamp(),
        ) {
            let fact = Fact::new(
                cluster,
                keyword.trim().to_string(),
                value.trim().to_string(),
                timestamp,
            );
            prop_assume!(!fact.keyword.is_empty() && !fact.value.is_empty());
            let parsed: Fact = fact.to_string().parse().unwrap();
            prop_assert_eq!(parsed, fact);
        }
    }
}
