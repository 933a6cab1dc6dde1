use disk_tunnel_summary_model::{Comparator, MetricName, Tier};
use itertools::Itertools;
use serde::Deserialize;
use sha3::Digest;
use std::collections::BTreeMap;
use std::path::Path;

const BUILTIN_TABLE: &str = include_str!("../thresholds.toml");

const DEFAULT_INSUFFICIENT_RECOMMENDATION: &str =
    "This drive does not meet the minimum requirements for this workload.";

#[derive(Debug, thiserror::Error)]
pub enum ThresholdTableError {
    #[error("Failed to read threshold table {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Threshold table is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid thresholds for workload '{workload}': {reason}")]
    Invalid { workload: String, reason: String },
}

/// One comparison that must hold for a tier to be earned.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Requirement {
    pub metric: MetricName,
    pub op: Comparator,
    pub bound: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TierSpec {
    pub tier: Tier,
    pub recommendation: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

#[derive(Debug, Deserialize)]
struct TableDocument {
    version: String,
    #[serde(default)]
    insufficient_recommendation: Option<String>,
    #[serde(default)]
    workloads: BTreeMap<String, Vec<TierSpec>>,
}

/// A validated, versioned threshold table.
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    version: String,
    digest: String,
    insufficient_recommendation: String,
    workloads: BTreeMap<String, Vec<TierSpec>>,
}

impl ThresholdTable {
    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self, ThresholdTableError> {
        Self::from_toml_str(BUILTIN_TABLE)
    }

    pub fn load(path: &Path) -> Result<Self, ThresholdTableError> {
        let content = std::fs::read_to_string(path).map_err(|source| ThresholdTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ThresholdTableError> {
        let document: TableDocument = toml::from_str(content)?;

        for (workload, tiers) in &document.workloads {
            validate_workload(workload, tiers)?;
        }

        let mut hasher = sha3::Sha3_256::new();
        Digest::update(&mut hasher, content.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        log::debug!(
            "Loaded threshold table version {} covering {} workload(s)",
            document.version,
            document.workloads.len()
        );

        Ok(Self {
            version: document.version,
            digest,
            insufficient_recommendation: document
                .insufficient_recommendation
                .unwrap_or_else(|| DEFAULT_INSUFFICIENT_RECOMMENDATION.to_string()),
            workloads: document.workloads,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// SHA3-256 of the table source, hex encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn insufficient_recommendation(&self) -> &str {
        &self.insufficient_recommendation
    }

    pub fn has_workload(&self, workload: &str) -> bool {
        self.workloads.contains_key(workload)
    }

    pub fn workloads(&self) -> impl Iterator<Item = &str> {
        self.workloads.keys().map(String::as_str)
    }

    /// Tier specifications for a workload, in the order they appear in the table.
    pub fn tiers(&self, workload: &str) -> Option<&[TierSpec]> {
        self.workloads.get(workload).map(Vec::as_slice)
    }
}

fn validate_workload(workload: &str, tiers: &[TierSpec]) -> Result<(), ThresholdTableError> {
    let invalid = |reason: String| ThresholdTableError::Invalid {
        workload: workload.to_string(),
        reason,
    };

    if tiers.iter().any(|t| t.tier == Tier::Insufficient) {
        return Err(invalid(
            "the insufficient tier is the fallback and cannot have requirements".to_string(),
        ));
    }

    if let Some(tier) = tiers.iter().map(|t| t.tier).duplicates().next() {
        return Err(invalid(format!("tier '{tier}' is listed more than once")));
    }

    for spec in tiers {
        if let Some(req) = spec.requirements.iter().find(|r| !r.bound.is_finite()) {
            return Err(invalid(format!(
                "tier '{}' has a non-finite bound for {}",
                spec.tier, req.metric
            )));
        }
    }

    Ok(())
}
