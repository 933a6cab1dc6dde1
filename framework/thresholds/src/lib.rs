//! Threshold tables and the tier evaluator.
//!
//! A threshold table maps each workload to the tiers it can earn, each tier being a
//! conjunction of metric comparisons. Tables are TOML documents with a version string. The
//! table compiled into the crate can be replaced by one loaded from disk.

mod evaluator;
mod table;

pub use evaluator::{evaluate, EvaluationError};
pub use table::{Requirement, ThresholdTable, ThresholdTableError, TierSpec};
