use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use disk_tunnel_summary_model::{
    append_run_history, load_state_file, write_state_file, RunRecord, StateFile,
};
use parking_lot::Mutex;

use crate::registry::Registry;

/// Mirrors the registry into the state file and appends finished runs to the history file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    history_path: Option<PathBuf>,
    persist_interval: Duration,
    // Held across snapshot and write so an older snapshot never replaces a newer one
    last_persist: Mutex<Option<Instant>>,
}

impl StateStore {
    pub fn new(path: PathBuf, history_path: Option<PathBuf>, persist_interval: Duration) -> Self {
        Self {
            path,
            history_path,
            persist_interval,
            last_persist: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records from the state file, or none if it does not exist yet.
    pub fn load(&self) -> anyhow::Result<Vec<RunRecord>> {
        let state = load_state_file(&self.path)
            .with_context(|| format!("Failed to load state file {}", self.path.display()))?;

        Ok(state.map(|s| s.runs).unwrap_or_default())
    }

    /// Write the registry to the state file now.
    pub fn persist(&self, registry: &Registry) -> anyhow::Result<()> {
        let mut last_persist = self.last_persist.lock();
        self.write(registry)?;
        *last_persist = Some(Instant::now());
        Ok(())
    }

    /// Whether the persist interval has passed since the last write. Never blocks, and a write
    /// still in progress counts as recent.
    pub fn persist_due(&self) -> bool {
        self.last_persist
            .try_lock()
            .is_some_and(|last| !last.is_some_and(|at| at.elapsed() < self.persist_interval))
    }

    /// Write the registry unless the last write was less than the persist interval ago.
    /// Returns whether a write happened.
    pub fn persist_throttled(&self, registry: &Registry) -> anyhow::Result<bool> {
        let mut last_persist = self.last_persist.lock();
        if last_persist.is_some_and(|at| at.elapsed() < self.persist_interval) {
            return Ok(false);
        }

        self.write(registry)?;
        *last_persist = Some(Instant::now());
        Ok(true)
    }

    /// Persist and log a failure instead of returning it. A run carries on when its state cannot
    /// be mirrored, the next write gets another chance.
    pub fn persist_or_warn(&self, registry: &Registry) {
        if let Err(e) = self.persist(registry) {
            log::warn!("{e:?}");
        }
    }

    pub fn record_history(&self, record: &RunRecord) {
        let Some(history_path) = &self.history_path else {
            return;
        };

        if let Err(e) = append_run_history(record, history_path) {
            log::warn!(
                "Failed to append run {} to history file {}: {e:?}",
                record.id,
                history_path.display()
            );
        }
    }

    fn write(&self, registry: &Registry) -> anyhow::Result<()> {
        let state = StateFile::new(registry.snapshot());
        write_state_file(&self.path, &state)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))
    }
}
