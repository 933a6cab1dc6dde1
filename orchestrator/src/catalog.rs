use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use disk_tunnel_runner::prelude::{PhasePlan, PlanSource};
use serde::Deserialize;

const BUILTIN_CATALOG: &str = include_str!("../workloads.toml");

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read workload catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Workload catalog is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid workload '{workload}': {reason}")]
    Invalid { workload: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    workloads: BTreeMap<String, PhasePlan>,
}

/// Named phase plans loaded from TOML.
#[derive(Debug, Clone)]
pub struct WorkloadCatalog {
    workloads: BTreeMap<String, PhasePlan>,
}

impl WorkloadCatalog {
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument = toml::from_str(content)?;

        for (workload, plan) in &document.workloads {
            validate_plan(workload, plan)?;
        }

        Ok(Self {
            workloads: document.workloads,
        })
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}

impl PlanSource for WorkloadCatalog {
    fn plan(&self, workload: &str) -> Option<PhasePlan> {
        self.workloads.get(workload).cloned()
    }

    fn workloads(&self) -> Vec<String> {
        self.workloads.keys().cloned().collect()
    }
}

fn validate_plan(workload: &str, plan: &PhasePlan) -> Result<(), CatalogError> {
    let invalid = |reason: String| CatalogError::Invalid {
        workload: workload.to_string(),
        reason,
    };

    if plan.phases.is_empty() {
        return Err(invalid("no phases".to_string()));
    }

    let mut names = HashSet::new();
    for phase in &plan.phases {
        if phase.duration_secs == 0 {
            return Err(invalid(format!("phase '{}' has zero duration", phase.name)));
        }
        if phase.weight.is_some_and(|w| !w.is_finite() || w < 0.0) {
            return Err(invalid(format!("phase '{}' has an invalid weight", phase.name)));
        }
        if !names.insert(phase.name.as_str()) {
            return Err(invalid(format!("phase '{}' is listed twice", phase.name)));
        }
    }

    Ok(())
}
