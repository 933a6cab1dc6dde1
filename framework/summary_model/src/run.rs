use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{ErrorKind, RunError};
use crate::metrics::NormalizedMetrics;
use crate::policy::EnginePolicy;
use crate::verdict::{Tier, Verdict};

/// Lifecycle state of a run.
///
/// `starting -> running -> {completed, failed, timeout}`, and `starting | running -> stopped`.
/// A run stuck in `starting` may also go straight to `failed`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
    Timeout,
}

impl RunStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Starting | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;

        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Running, Timeout)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named sub-interval of a run's phase plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub duration_secs: u64,
    /// Relative share of the overall progress bar. Defaults to the phase duration when a plan
    /// does not specify one.
    pub weight: f64,
}

/// A coalesced progress snapshot written by the monitoring task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase_index: usize,
    pub percent: f64,
    pub elapsed_seconds: u64,
    pub eta_seconds: Option<u64>,
    pub output_tail: Option<String>,
}

/// How a run ended.
///
/// Only [Termination::Completed] carries a verdict, which is how a record keeps the
/// "verdict iff completed" rule without runtime checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed {
        metrics: NormalizedMetrics,
        verdict: Verdict,
    },
    Failed {
        error: RunError,
        /// Partial telemetry, when the engine left a usable payload behind.
        metrics: Option<NormalizedMetrics>,
    },
    TimedOut {
        error: RunError,
        metrics: Option<NormalizedMetrics>,
    },
    Stopped,
}

impl Termination {
    pub fn status(&self) -> RunStatus {
        match self {
            Termination::Completed { .. } => RunStatus::Completed,
            Termination::Failed { .. } => RunStatus::Failed,
            Termination::TimedOut { .. } => RunStatus::Timeout,
            Termination::Stopped => RunStatus::Stopped,
        }
    }
}

/// What to do with a record found active in the state file at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    #[default]
    Failed,
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run {id} is already {status}")]
    AlreadyTerminal { id: String, status: RunStatus },
    #[error("run {id} cannot move from {from} to {to}")]
    Invalid {
        id: String,
        from: RunStatus,
        to: RunStatus,
    },
}

/// One benchmark execution, from admission to terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub workload_type: String,
    pub target_path: PathBuf,
    pub size_bytes: u64,
    pub status: RunStatus,
    pub phases: Vec<Phase>,
    pub current_phase_index: usize,
    pub progress_percent: f64,
    pub elapsed_seconds: u64,
    pub eta_seconds: Option<u64>,
    /// Process id of the supervised engine. Diagnostic only, never written to durable storage.
    #[serde(skip)]
    pub pid: Option<u32>,
    /// Most recent engine output, capped by the runner.
    #[serde(default)]
    pub raw_output: String,
    pub metrics: Option<NormalizedMetrics>,
    pub verdict: Option<Verdict>,
    pub error: Option<RunError>,
    #[serde(default)]
    pub engine_policy: Option<EnginePolicy>,
    #[serde(default)]
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Create a new record in the `starting` state.
    pub fn new(
        id: String,
        workload_type: String,
        target_path: PathBuf,
        size_bytes: u64,
        phases: Vec<Phase>,
    ) -> Self {
        let now = Utc::now();
        let eta_seconds = Some(phases.iter().map(|p| p.duration_secs).sum());
        Self {
            id,
            workload_type,
            target_path,
            size_bytes,
            status: RunStatus::Starting,
            phases,
            current_phase_index: 0,
            progress_percent: 0.0,
            elapsed_seconds: 0,
            eta_seconds,
            pid: None,
            raw_output: String::new(),
            metrics: None,
            verdict: None,
            error: None,
            engine_policy: None,
            stop_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total planned duration of all phases, in seconds.
    pub fn planned_duration_secs(&self) -> u64 {
        self.phases.iter().map(|p| p.duration_secs).sum()
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current_phase_index)
    }

    /// Record that the engine process has been launched.
    pub fn mark_running(
        &mut self,
        pid: Option<u32>,
        policy: EnginePolicy,
    ) -> Result<(), TransitionError> {
        self.check_transition(RunStatus::Running)?;
        self.status = RunStatus::Running;
        self.pid = pid;
        self.engine_policy = Some(policy);
        self.touch();
        Ok(())
    }

    /// Apply a progress snapshot. Progress never moves backwards and terminal records are left
    /// untouched. Returns whether anything was applied.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let last_phase = self.phases.len().saturating_sub(1);
        self.current_phase_index = self
            .current_phase_index
            .max(update.phase_index.min(last_phase));
        self.progress_percent = self.progress_percent.max(update.percent.clamp(0.0, 100.0));
        self.elapsed_seconds = self.elapsed_seconds.max(update.elapsed_seconds);
        self.eta_seconds = update.eta_seconds;
        if let Some(tail) = &update.output_tail {
            self.raw_output.clone_from(tail);
        }
        self.touch();
        true
    }

    /// Flag the run as asked to stop. Returns `false` if it was already flagged or is terminal.
    pub fn request_stop(&mut self) -> bool {
        if self.status.is_terminal() || self.stop_requested {
            return false;
        }
        self.stop_requested = true;
        self.touch();
        true
    }

    /// Move the run into a terminal state.
    pub fn terminate(
        &mut self,
        termination: Termination,
        output_tail: Option<String>,
    ) -> Result<(), TransitionError> {
        let next = termination.status();
        self.check_transition(next)?;

        match termination {
            Termination::Completed { metrics, verdict } => {
                self.progress_percent = 100.0;
                self.current_phase_index = self.phases.len().saturating_sub(1);
                self.metrics = Some(metrics);
                self.verdict = Some(verdict);
                self.error = None;
            }
            Termination::Failed { error, metrics } | Termination::TimedOut { error, metrics } => {
                self.metrics = metrics;
                self.verdict = None;
                self.error = Some(error);
            }
            Termination::Stopped => {
                self.verdict = None;
                self.error = None;
            }
        }

        if let Some(tail) = output_tail {
            self.raw_output = tail;
        }
        self.status = next;
        self.eta_seconds = Some(0);
        self.pid = None;
        self.touch();
        Ok(())
    }

    /// Reconcile a record that was active when the controller last stopped. Its engine process
    /// is presumed lost. Returns whether the record changed.
    pub fn reconcile_after_restart(&mut self, policy: ReconcilePolicy) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let previous = self.status;
        let termination = match policy {
            ReconcilePolicy::Failed => Termination::Failed {
                error: RunError::new(
                    ErrorKind::Interrupted,
                    format!(
                        "controller restarted while the run was {previous}; \
                         engine process presumed lost"
                    ),
                ),
                metrics: None,
            },
            ReconcilePolicy::Stopped => Termination::Stopped,
        };

        // Every active status may move to failed or stopped, so this cannot be rejected.
        self.terminate(termination, None).is_ok()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            workload_type: self.workload_type.clone(),
            status: self.status,
            progress_percent: self.progress_percent,
            tier: self.verdict.as_ref().map(|v| v.tier),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn check_transition(&self, next: RunStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Short projection of a run for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub workload_type: String,
    pub status: RunStatus,
    pub progress_percent: f64,
    pub tier: Option<Tier>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
