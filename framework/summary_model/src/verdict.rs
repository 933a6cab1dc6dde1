use serde::{Deserialize, Serialize};
use std::fmt;

use crate::metrics::MetricName;

/// Qualitative verdict bucket, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Insufficient,
    Minimum,
    Recommended,
    Excellent,
}

impl Tier {
    /// Tiers that can be earned, best first. `Insufficient` is the fallback and is never listed
    /// in a threshold table.
    pub const RANKED: [Tier; 3] = [Tier::Excellent, Tier::Recommended, Tier::Minimum];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Insufficient => "insufficient",
            Tier::Minimum => "minimum",
            Tier::Recommended => "recommended",
            Tier::Excellent => "excellent",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied between an observed metric and a tier bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=")]
    AtLeast,
    #[serde(rename = "<=")]
    AtMost,
}

impl Comparator {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::AtLeast => observed >= bound,
            Comparator::AtMost => observed <= bound,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::AtLeast => f.write_str(">="),
            Comparator::AtMost => f.write_str("<="),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed,
    /// The metric was absent from the payload, so the requirement was not applied.
    Skipped,
}

/// Result of checking one requirement of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCheck {
    pub tier: Tier,
    pub metric: MetricName,
    pub comparator: Comparator,
    pub bound: f64,
    pub observed: Option<f64>,
    pub outcome: CheckOutcome,
}

/// Verdict attached to a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub tier: Tier,
    pub recommendation: String,
    /// Checks of every tier that was evaluated, best tier first, stopping at the selected one.
    pub breakdown: Vec<MetricCheck>,
    /// Version string of the threshold table that produced this verdict.
    pub table_version: String,
    /// Digest of the threshold table content.
    pub table_digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_order_worst_to_best() {
        assert!(Tier::Insufficient < Tier::Minimum);
        assert!(Tier::Minimum < Tier::Recommended);
        assert!(Tier::Recommended < Tier::Excellent);
    }

    #[test]
    fn comparator_bounds_are_inclusive() {
        assert!(Comparator::AtLeast.holds(600.0, 600.0));
        assert!(!Comparator::AtLeast.holds(599.9, 600.0));
        assert!(Comparator::AtMost.holds(3.0, 3.0));
        assert!(!Comparator::AtMost.holds(3.1, 3.0));
    }

    #[test]
    fn comparator_uses_symbol_in_serde() {
        assert_eq!(serde_json::to_string(&Comparator::AtLeast).unwrap(), "\">=\"");
        let parsed: Comparator = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(parsed, Comparator::AtMost);
    }
}
