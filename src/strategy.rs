//! Redundancy prefetch strategy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecoveryError;

/// How eagerly redundancy is fetched relative to what was asked for.
///
/// - `Requested`: only the ids a caller asked for.
/// - `Data`: also every sibling data shard of the parent.
/// - `All`: every data and parity shard of the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Requested,
    Data,
    All,
}

impl Strategy {
    pub fn all(&self) -> bool {
        matches!(self, Strategy::All)
    }

    /// True when every data shard is wanted (`Data` and `All`).
    pub fn data(&self) -> bool {
        matches!(self, Strategy::Data | Strategy::All)
    }

    pub fn requested(&self) -> bool {
        matches!(self, Strategy::Requested)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Requested => "requested",
            Strategy::Data => "data",
            Strategy::All => "all",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "requested" => Ok(Strategy::Requested),
            "data" => Ok(Strategy::Data),
            "all" => Ok(Strategy::All),
            other => Err(RecoveryError::InvalidFormat(format!(
                "unknown strategy '{}' (expected requested, data or all)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(Strategy::Requested.requested());
        assert!(!Strategy::Requested.data());
        assert!(Strategy::Data.data() && !Strategy::Data.all());
        assert!(Strategy::All.data() && Strategy::All.all());
    }

    #[test]
    fn test_parse() {
        assert_eq!("data".parse::<Strategy>().unwrap(), Strategy::Data);
        assert_eq!("ALL".parse::<Strategy>().unwrap(), Strategy::All);
        assert!("some".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Strategy::All).unwrap(), "\"all\"");
        let s: Strategy = serde_json::from_str("\"requested\"").unwrap();
        assert_eq!(s, Strategy::Requested);
    }
}
