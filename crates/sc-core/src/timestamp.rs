//! Temporal tags attached to facts.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of temporal tags. `ADM` and `DC` are accepted as aliases
/// on input and normalized to the long forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timestamp {
    Past,
    Admission,
    Discharge,
    Unknown,
}

impl Timestamp {
    /// Dedup priority: Discharge beats Admission beats everything else.
    pub fn rank(&self) -> u8 {
        match self {
            Timestamp::Discharge => 2,
            Timestamp::Admission => 1,
            Timestamp::Past | Timestamp::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timestamp::Past => "Past",
            Timestamp::Admission => "Admission",
            Timestamp::Discharge => "Discharge",
            Timestamp::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timestamp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "past" => Ok(Timestamp::Past),
            "admission" | "adm" => Ok(Timestamp::Admission),
            "discharge" | "dc" => Ok(Timestamp::Discharge),
            "unknown" => Ok(Timestamp::Unknown),
            other => Err(CoreError::InvalidTimestamp(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_normalize() {
        assert_eq!("ADM".parse::<Timestamp>().unwrap(), Timestamp::Admission);
        assert_eq!("dc".parse::<Timestamp>().unwrap(), Timestamp::Discharge);
        assert_eq!("Past".parse::<Timestamp>().unwrap(), Timestamp::Past);
        assert!("yesterday".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_rank_order() {
        assert!(Timestamp::Discharge.rank() > Timestamp::Admission.rank());
        assert!(Timestamp::Admission.rank() > Timestamp::Past.rank());
        assert_eq!(Timestamp::Past.rank(), Timestamp::Unknown.rank());
    }
}
