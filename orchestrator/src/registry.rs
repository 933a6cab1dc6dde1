use disk_tunnel_core::prelude::ShutdownHandle;
use disk_tunnel_summary_model::{RunRecord, RunStatus, RunSummary, Termination, TransitionError};
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Run {active_id} is already active")]
    Busy { active_id: String },
    #[error("Run {0} not found")]
    NotFound(String),
    #[error("Run {0} is still active")]
    Active(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// The result of asking a run to stop.
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub status: RunStatus,
    /// Set only for the first request against an active run, so the engine is signalled once.
    pub cancel: Option<ShutdownHandle>,
}

#[derive(Debug)]
struct ActiveSlot {
    id: String,
    cancel: ShutdownHandle,
}

#[derive(Debug, Default)]
struct RegistryState {
    // Oldest first
    runs: Vec<RunRecord>,
    active: Option<ActiveSlot>,
}

impl RegistryState {
    fn find(&self, id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|r| r.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut RunRecord> {
        self.runs.iter_mut().find(|r| r.id == id)
    }

    fn release(&mut self, id: &str) -> bool {
        if self.active.as_ref().is_some_and(|slot| slot.id == id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    fn prune(&mut self, retention: usize) -> usize {
        let terminal = self.runs.iter().filter(|r| r.status.is_terminal()).count();
        let mut excess = terminal.saturating_sub(retention);
        let pruned = excess;

        self.runs.retain(|r| {
            if excess > 0 && r.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });

        pruned
    }
}

/// In-memory table of runs plus the single active-run slot.
///
/// All access goes through one lock, so claiming the slot is a single compare-and-set and
/// pollers always read a whole record.
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    retention: usize,
}

impl Registry {
    pub fn new(retention: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            retention,
        }
    }

    /// Claim the active slot for `record` or fail with the id of the run holding it.
    pub fn try_admit(&self, record: RunRecord, cancel: ShutdownHandle) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if let Some(slot) = &state.active {
            return Err(RegistryError::Busy {
                active_id: slot.id.clone(),
            });
        }

        state.active = Some(ActiveSlot {
            id: record.id.clone(),
            cancel,
        });
        state.runs.push(record);
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.state.read().active.as_ref().map(|slot| slot.id.clone())
    }

    pub fn get(&self, id: &str) -> Option<RunRecord> {
        self.state.read().find(id).cloned()
    }

    /// Mutate a record in place. Returns `None` when the run does not exist.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut RunRecord) -> R) -> Option<R> {
        self.state.write().find_mut(id).map(f)
    }

    pub fn request_stop(&self, id: &str) -> Result<StopRequest, RegistryError> {
        let mut state = self.state.write();
        let cancel = state
            .active
            .as_ref()
            .filter(|slot| slot.id == id)
            .map(|slot| slot.cancel.clone());

        let record = state
            .find_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let first = record.request_stop();

        Ok(StopRequest {
            status: record.status,
            cancel: cancel.filter(|_| first),
        })
    }

    /// Move a run to its terminal state and release the active slot.
    ///
    /// The slot is released even when the transition is rejected, so a run can never hold it
    /// after its supervisor has finished.
    pub fn finish(
        &self,
        id: &str,
        termination: Termination,
        output_tail: Option<String>,
    ) -> Result<RunRecord, RegistryError> {
        let mut state = self.state.write();
        state.release(id);

        let record = state
            .find_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.terminate(termination, output_tail)?;
        let finished = record.clone();

        let pruned = state.prune(self.retention);
        if pruned > 0 {
            log::debug!("Pruned {pruned} finished run(s) beyond the retention limit");
        }

        Ok(finished)
    }

    /// Release the active slot if `id` holds it. Returns whether it did.
    pub fn release(&self, id: &str) -> bool {
        self.state.write().release(id)
    }

    /// Summaries of the most recent runs, newest first.
    pub fn list(&self, limit: usize) -> Vec<RunSummary> {
        self.state
            .read()
            .runs
            .iter()
            .rev()
            .take(limit)
            .map(RunRecord::summary)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<RunRecord> {
        self.state.read().runs.clone()
    }

    /// Drop a finished run.
    pub fn remove(&self, id: &str) -> Result<RunRecord, RegistryError> {
        let mut state = self.state.write();
        let index = state
            .runs
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if state.runs[index].status.is_active() {
            return Err(RegistryError::Active(id.to_string()));
        }

        Ok(state.runs.remove(index))
    }

    /// Replace the table with records loaded from durable storage.
    ///
    /// Records must already be reconciled. Nothing loaded can hold the active slot because its
    /// engine process did not survive the restart.
    pub fn restore(&self, mut records: Vec<RunRecord>) {
        records.sort_by_key(|r| r.created_at);

        let mut state = self.state.write();
        state.runs = records;
        state.active = None;
        state.prune(self.retention);
    }

    pub fn len(&self) -> usize {
        self.state.read().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk_tunnel_summary_model::{ErrorKind, Phase, RunError};
    use std::path::PathBuf;

    fn record(id: &str) -> RunRecord {
        RunRecord::new(
            id.to_string(),
            "quick_max".to_string(),
            PathBuf::from("/tmp"),
            1 << 30,
            vec![Phase {
                name: "seq_read".to_string(),
                duration_secs: 10,
                weight: 10.0,
            }],
        )
    }

    fn failed() -> Termination {
        Termination::Failed {
            error: RunError::new(ErrorKind::EngineCrashed, "boom"),
            metrics: None,
        }
    }

    #[test]
    fn second_admission_is_busy() {
        let registry = Registry::new(10);
        registry.try_admit(record("a"), ShutdownHandle::new()).unwrap();

        let err = registry
            .try_admit(record("b"), ShutdownHandle::new())
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Busy {
                active_id: "a".to_string()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn finishing_releases_the_slot() {
        let registry = Registry::new(10);
        registry.try_admit(record("a"), ShutdownHandle::new()).unwrap();

        let finished = registry.finish("a", Termination::Stopped, None).unwrap();
        assert_eq!(finished.status, RunStatus::Stopped);
        assert_eq!(registry.active_id(), None);

        registry.try_admit(record("b"), ShutdownHandle::new()).unwrap();
        assert_eq!(registry.active_id().as_deref(), Some("b"));
    }

    #[test]
    fn rejected_finish_still_releases_the_slot() {
        let registry = Registry::new(10);
        registry.try_admit(record("a"), ShutdownHandle::new()).unwrap();
        registry.finish("a", Termination::Stopped, None).unwrap();

        // A late second finish must not overwrite the first
        let err = registry.finish("a", failed(), None).unwrap_err();
        assert!(matches!(err, RegistryError::Transition(_)));
        assert_eq!(registry.get("a").unwrap().status, RunStatus::Stopped);
    }

    #[test]
    fn stop_signals_only_once() {
        let registry = Registry::new(10);
        let cancel = ShutdownHandle::new();
        registry.try_admit(record("a"), cancel.clone()).unwrap();

        let first = registry.request_stop("a").unwrap();
        assert_eq!(first.status, RunStatus::Starting);
        assert!(first.cancel.is_some());

        let second = registry.request_stop("a").unwrap();
        assert!(second.cancel.is_none());
        assert!(registry.get("a").unwrap().stop_requested);
    }

    #[test]
    fn stop_on_terminal_run_is_a_no_op() {
        let registry = Registry::new(10);
        registry.try_admit(record("a"), ShutdownHandle::new()).unwrap();
        registry.finish("a", failed(), None).unwrap();

        let request = registry.request_stop("a").unwrap();
        assert_eq!(request.status, RunStatus::Failed);
        assert!(request.cancel.is_none());
        assert!(!registry.get("a").unwrap().stop_requested);
    }

    #[test]
    fn stop_on_unknown_run_is_not_found() {
        let registry = Registry::new(10);
        assert!(matches!(
            registry.request_stop("nope"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let registry = Registry::new(10);
        for id in ["a", "b", "c"] {
            registry.try_admit(record(id), ShutdownHandle::new()).unwrap();
            registry.finish(id, Termination::Stopped, None).unwrap();
        }

        let ids: Vec<_> = registry.list(2).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn retention_drops_oldest_finished_runs() {
        let registry = Registry::new(2);
        for id in ["a", "b", "c"] {
            registry.try_admit(record(id), ShutdownHandle::new()).unwrap();
            registry.finish(id, Termination::Stopped, None).unwrap();
        }
        registry.try_admit(record("d"), ShutdownHandle::new()).unwrap();

        let ids: Vec<_> = registry.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn active_run_cannot_be_removed() {
        let registry = Registry::new(10);
        registry.try_admit(record("a"), ShutdownHandle::new()).unwrap();
        assert_eq!(
            registry.remove("a").unwrap_err(),
            RegistryError::Active("a".to_string())
        );

        registry.finish("a", Termination::Stopped, None).unwrap();
        assert_eq!(registry.remove("a").unwrap().id, "a");
        assert!(registry.is_empty());
        assert!(matches!(
            registry.remove("a"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn progress_updates_go_through_update() {
        let registry = Registry::new(10);
        registry.try_admit(record("a"), ShutdownHandle::new()).unwrap();

        let applied = registry.update("a", |r| {
            r.apply_progress(&disk_tunnel_summary_model::ProgressUpdate {
                phase_index: 0,
                percent: 42.0,
                elapsed_seconds: 4,
                eta_seconds: Some(6),
                output_tail: None,
            })
        });
        assert_eq!(applied, Some(true));
        assert_eq!(registry.get("a").unwrap().progress_percent, 42.0);
        assert_eq!(registry.update("missing", |_| ()), None);
    }
}
