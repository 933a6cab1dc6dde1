use std::collections::BTreeMap;

use disk_tunnel_summary_model::Phase;
use serde::Deserialize;

/// One phase of a workload as supplied by a [PlanSource].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub duration_secs: u64,
    /// Share of the progress bar. Defaults to the phase duration.
    #[serde(default)]
    pub weight: Option<f64>,
    /// fio job options for this phase, passed through verbatim.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PhaseSpec {
    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(self.duration_secs as f64)
    }

    pub fn to_phase(&self) -> Phase {
        Phase {
            name: self.name.clone(),
            duration_secs: self.duration_secs,
            weight: self.effective_weight(),
        }
    }
}

/// The ordered phases of a workload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PhasePlan {
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseSpec>,
}

impl PhasePlan {
    pub fn total_duration_secs(&self) -> u64 {
        self.phases.iter().map(|p| p.duration_secs).sum()
    }

    pub fn to_phases(&self) -> Vec<Phase> {
        self.phases.iter().map(PhaseSpec::to_phase).collect()
    }
}

/// Supplies the phase plan for a named workload.
///
/// Plans are produced outside the runner and taken as already validated.
pub trait PlanSource: Send + Sync {
    fn plan(&self, workload: &str) -> Option<PhasePlan>;

    /// Names of every workload this source knows, in a stable order.
    fn workloads(&self) -> Vec<String>;
}
