use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use disk_tunnel_core::prelude::{ShutdownHandle, ShutdownListener};
use disk_tunnel_runner::prelude::{
    run_engine, PhasePlan, PlanSource, ProgressSink, RunOutcome, RunRequest, RunnerConfig,
};
use disk_tunnel_summary_model::{
    EnginePolicy, ErrorKind, ProgressUpdate, ReconcilePolicy, RunError, RunRecord, RunStatus,
    RunSummary, Termination,
};
use disk_tunnel_thresholds::{evaluate, ThresholdTable};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{AdmissionConfig, Config};
use crate::registry::{Registry, RegistryError};
use crate::state_store::StateStore;

const RUN_ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Why a start request was refused before anything was launched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Run {active_id} is still active")]
    Busy { active_id: String },
    #[error("Invalid run request: {}", problems.join("; "))]
    InvalidInput { problems: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub workload_type: String,
    pub target_path: PathBuf,
    pub size_bytes: u64,
}

/// Answer to a stop request. `accepted` is false when the run had already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopAck {
    pub accepted: bool,
    pub status: RunStatus,
}

/// Public control surface for benchmark runs.
///
/// Cheap to clone. Every clone shares one registry, so at most one run is active across all of
/// them.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    store: StateStore,
    catalog: Arc<dyn PlanSource>,
    thresholds: ThresholdTable,
    runner_config: RunnerConfig,
    admission: AdmissionConfig,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Load the state file, reconcile runs left active by a previous process and get ready to
    /// admit new runs.
    pub fn open(
        config: &Config,
        catalog: Arc<dyn PlanSource>,
        thresholds: ThresholdTable,
    ) -> anyhow::Result<Self> {
        let store = StateStore::new(
            config.state.path.clone(),
            config.state.history_path.clone(),
            Duration::from_secs(config.state.persist_interval_secs),
        );

        let mut records = store.load()?;
        let reconciled = reconcile(&mut records, config.state.reconcile);

        let registry = Registry::new(config.state.retention);
        registry.restore(records);
        if reconciled > 0 {
            store.persist_or_warn(&registry);
        }
        log::info!(
            "Loaded {} run(s) from {}",
            registry.len(),
            store.path().display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                store,
                catalog,
                thresholds,
                runner_config: config.engine.runner_config(),
                admission: config.admission.clone(),
                supervisor: Mutex::new(None),
            }),
        })
    }

    /// Admit a run and hand it to the runner in the background.
    ///
    /// Returns as soon as the run is recorded as `starting`.
    pub fn start_run(&self, request: StartRequest) -> Result<RunRecord, AdmissionError> {
        if let Some(active_id) = self.inner.registry.active_id() {
            return Err(AdmissionError::Busy { active_id });
        }

        let plan = self.validate(&request)?;

        let id = nanoid::nanoid!(12, &RUN_ID_ALPHABET);
        let record = RunRecord::new(
            id.clone(),
            request.workload_type.clone(),
            request.target_path.clone(),
            request.size_bytes,
            plan.to_phases(),
        );

        let cancel = ShutdownHandle::new();
        let listener = cancel.new_listener();
        self.inner
            .registry
            .try_admit(record.clone(), cancel)
            .map_err(|e| match e {
                RegistryError::Busy { active_id } => AdmissionError::Busy { active_id },
                other => AdmissionError::InvalidInput {
                    problems: vec![other.to_string()],
                },
            })?;
        self.persist_in_background();

        log::info!(
            "Admitted run {id}: workload {} on {} ({} bytes, {}s planned)",
            request.workload_type,
            request.target_path.display(),
            request.size_bytes,
            plan.total_duration_secs()
        );

        let run_request = RunRequest {
            run_id: id,
            target_path: request.target_path,
            size_bytes: request.size_bytes,
            plan,
        };
        let supervisor = self.spawn_supervised(run_request, request.workload_type, listener);
        *self.inner.supervisor.lock() = Some(supervisor);

        Ok(record)
    }

    pub fn get_run(&self, id: &str) -> Option<RunRecord> {
        self.inner.registry.get(id)
    }

    /// Ask an active run to stop. The run moves to `stopped` once the engine has exited.
    ///
    /// Stopping a finished run, or stopping twice, does nothing.
    pub fn stop_run(&self, id: &str) -> Result<StopAck, RegistryError> {
        let request = self.inner.registry.request_stop(id)?;

        if let Some(cancel) = request.cancel {
            log::info!("Stop requested for run {id}");
            cancel.shutdown();
            self.persist_in_background();
        }

        Ok(StopAck {
            accepted: request.status.is_active(),
            status: request.status,
        })
    }

    pub fn list_runs(&self, limit: usize) -> Vec<RunSummary> {
        self.inner.registry.list(limit)
    }

    /// Delete a finished run from the registry and the state file.
    pub fn remove_run(&self, id: &str) -> Result<RunRecord, RegistryError> {
        let record = self.inner.registry.remove(id)?;
        self.persist_in_background();
        log::info!("Removed run {id}");
        Ok(record)
    }

    pub fn catalog(&self) -> &dyn PlanSource {
        self.inner.catalog.as_ref()
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.inner.thresholds
    }

    /// Stop the active run, if any, wait up to `wait` for it to finish and write the final state.
    pub async fn shutdown(&self, wait: Duration) {
        if let Some(active_id) = self.inner.registry.active_id() {
            if let Err(e) = self.stop_run(&active_id) {
                log::warn!("Failed to stop run {active_id} during shutdown: {e}");
            }
        }

        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if tokio::time::timeout(wait, supervisor).await.is_err() {
                log::warn!("Active run did not finish within {wait:?} of shutdown");
            }
        }

        if let Err(e) = self.persist_in_background().await {
            log::warn!("Final state write did not complete: {e}");
        }
    }

    /// Mirror the registry to the state file on the blocking pool, off the async workers that
    /// serve polls.
    fn persist_in_background(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.store.persist_or_warn(&inner.registry))
    }

    fn validate(&self, request: &StartRequest) -> Result<PhasePlan, AdmissionError> {
        let mut problems = Vec::new();

        let plan = self.inner.catalog.plan(&request.workload_type);
        if plan.is_none() {
            problems.push(format!(
                "unknown workload type '{}'",
                request.workload_type
            ));
        } else if !self.inner.thresholds.has_workload(&request.workload_type) {
            problems.push(format!(
                "no thresholds defined for workload type '{}'",
                request.workload_type
            ));
        }

        let admission = &self.inner.admission;
        if request.size_bytes < admission.min_size_bytes
            || request.size_bytes > admission.max_size_bytes
        {
            problems.push(format!(
                "size {} bytes is outside the allowed range {}..={}",
                request.size_bytes, admission.min_size_bytes, admission.max_size_bytes
            ));
        }

        let target = &request.target_path;
        if !target.exists() {
            problems.push(format!("target path {} does not exist", target.display()));
        } else if !target.is_dir() {
            problems.push(format!("target path {} is not a directory", target.display()));
        } else if let Err(e) = probe_writable(target) {
            problems.push(format!(
                "target path {} is not writable: {e}",
                target.display()
            ));
        } else if admission.check_free_space {
            if let Some(available) = available_space(target) {
                if request.size_bytes > available {
                    problems.push(format!(
                        "size {} bytes exceeds the {available} bytes available on {}",
                        request.size_bytes,
                        target.display()
                    ));
                }
            }
        }

        match plan {
            Some(plan) if problems.is_empty() => Ok(plan),
            _ => Err(AdmissionError::InvalidInput { problems }),
        }
    }

    /// Run the engine inside its own task and watch that task from another, so that a panic in
    /// the run still ends with a terminal record and a free slot.
    fn spawn_supervised(
        &self,
        request: RunRequest,
        workload_type: String,
        listener: ShutdownListener,
    ) -> JoinHandle<()> {
        let run_id = request.run_id.clone();
        let driver = tokio::spawn(self.clone().drive_run(request, workload_type, listener));

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                log::error!("Run {run_id} supervisor failed: {e}");
                this.finish(
                    &run_id,
                    Termination::Failed {
                        error: RunError::new(
                            ErrorKind::EngineCrashed,
                            format!("run supervisor failed: {e}"),
                        ),
                        metrics: None,
                    },
                    None,
                )
                .await;
            }

            if this.inner.registry.release(&run_id) {
                log::warn!("Run {run_id} still held the active slot after its supervisor ended");
            }
        })
    }

    async fn drive_run(
        self,
        request: RunRequest,
        workload_type: String,
        listener: ShutdownListener,
    ) {
        let sink = RegistrySink {
            orchestrator: &self,
            run_id: &request.run_id,
        };
        let outcome = run_engine(&request, &self.inner.runner_config, &sink, listener).await;

        let (termination, output_tail) = match outcome {
            RunOutcome::Completed {
                report,
                output_tail,
            } => match evaluate(&self.inner.thresholds, &workload_type, &report.metrics) {
                Ok(verdict) => (
                    Termination::Completed {
                        metrics: report.metrics,
                        verdict,
                    },
                    output_tail,
                ),
                Err(e) => (
                    Termination::Failed {
                        error: RunError::new(ErrorKind::OutputUnparseable, e.to_string()),
                        metrics: Some(report.metrics),
                    },
                    output_tail,
                ),
            },
            RunOutcome::Failed {
                error,
                metrics,
                output_tail,
            } => (Termination::Failed { error, metrics }, output_tail),
            RunOutcome::TimedOut {
                error,
                metrics,
                output_tail,
            } => (Termination::TimedOut { error, metrics }, output_tail),
            RunOutcome::Stopped { output_tail } => (Termination::Stopped, output_tail),
        };

        self.finish(&request.run_id, termination, Some(output_tail)).await;
    }

    /// Record the terminal state, then wait for the state file and history to catch up.
    async fn finish(&self, run_id: &str, termination: Termination, output_tail: Option<String>) {
        let finished = match self.inner.registry.finish(run_id, termination, output_tail) {
            Ok(record) => {
                match (&record.verdict, &record.error) {
                    (Some(verdict), _) => log::info!(
                        "Run {run_id} {}: rated {} ({})",
                        record.status,
                        verdict.tier,
                        verdict.recommendation
                    ),
                    (None, Some(error)) => log::warn!("Run {run_id} {}: {error}", record.status),
                    (None, None) => log::info!("Run {run_id} {}", record.status),
                }
                Some(record)
            }
            Err(e) => {
                log::warn!("Could not finish run {run_id}: {e}");
                None
            }
        };

        let inner = Arc::clone(&self.inner);
        let written = tokio::task::spawn_blocking(move || {
            inner.store.persist_or_warn(&inner.registry);
            if let Some(record) = finished {
                inner.store.record_history(&record);
            }
        })
        .await;
        if let Err(e) = written {
            log::warn!("State write for run {run_id} did not complete: {e}");
        }
    }
}

/// Feeds runner callbacks into the registry record of one run.
struct RegistrySink<'a> {
    orchestrator: &'a Orchestrator,
    run_id: &'a str,
}

impl ProgressSink for RegistrySink<'_> {
    fn launched(&self, pid: Option<u32>, policy: &EnginePolicy) {
        let inner = &self.orchestrator.inner;
        let result = inner
            .registry
            .update(self.run_id, |r| r.mark_running(pid, policy.clone()));

        match result {
            Some(Ok(())) => {
                log::info!(
                    "Run {} is running (pid {}, ioengine {})",
                    self.run_id,
                    pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()),
                    policy.ioengine
                );
                self.orchestrator.persist_in_background();
            }
            Some(Err(e)) => log::warn!("{e}"),
            None => log::warn!("Run {} vanished from the registry", self.run_id),
        }
    }

    fn progress(&self, update: ProgressUpdate) {
        let inner = &self.orchestrator.inner;
        if inner.registry.update(self.run_id, |r| r.apply_progress(&update)) != Some(true) {
            return;
        }

        if !inner.store.persist_due() {
            return;
        }

        let inner = Arc::clone(inner);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = inner.store.persist_throttled(&inner.registry) {
                log::warn!("{e:?}");
            }
        });
    }
}

/// Terminate records that were active when the previous process exited. Returns how many
/// changed.
fn reconcile(records: &mut [RunRecord], policy: ReconcilePolicy) -> usize {
    let mut reconciled = 0;
    for record in records.iter_mut() {
        let previous = record.status;
        if record.reconcile_after_restart(policy) {
            log::warn!(
                "Run {} was {previous} when the controller last stopped, marked {}",
                record.id,
                record.status
            );
            reconciled += 1;
        }
    }
    reconciled
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    // Removed when dropped
    tempfile::Builder::new()
        .prefix(".disk-tunnel-probe-")
        .tempfile_in(dir)
        .map(drop)
}

/// Space available on the disk holding `path`, from the mount point that is its longest prefix.
fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk_tunnel_summary_model::Phase;

    #[test]
    fn reconcile_marks_active_runs_failed() {
        let mut records = vec![RunRecord::new(
            "a".to_string(),
            "quick_max".to_string(),
            PathBuf::from("/tmp"),
            1 << 30,
            vec![Phase {
                name: "seq_read".to_string(),
                duration_secs: 10,
                weight: 10.0,
            }],
        )];
        let mut finished = records[0].clone();
        finished.id = "b".to_string();
        finished.terminate(Termination::Stopped, None).unwrap();
        records.push(finished);

        assert_eq!(reconcile(&mut records, ReconcilePolicy::Failed), 1);
        assert_eq!(records[0].status, RunStatus::Failed);
        assert_eq!(
            records[0].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Interrupted)
        );
        assert_eq!(records[1].status, RunStatus::Stopped);
    }

    #[test]
    fn probe_detects_writable_directory() {
        let dir = tempfile::tempdir().unwrap();
        probe_writable(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn admission_error_lists_every_problem() {
        let err = AdmissionError::InvalidInput {
            problems: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Invalid run request: a; b");
    }
}
