use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;

use crate::run::RunRecord;

/// Current version of the state file layout.
pub const STATE_FILE_VERSION: u32 = 1;

/// Durable snapshot of every known run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub runs: Vec<RunRecord>,
}

impl StateFile {
    pub fn new(runs: Vec<RunRecord>) -> Self {
        Self {
            version: STATE_FILE_VERSION,
            saved_at: Utc::now(),
            runs,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateFileError {
    #[error("IO error on state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported state file version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Write the state file atomically.
///
/// The content goes to a temporary file in the same directory which is synced and then renamed
/// over the target, so readers only ever see a complete old or a complete new file.
pub fn write_state_file(path: &Path, state: &StateFile) -> Result<(), StateFileError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, state)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Load the state file, returning `None` if it does not exist yet.
pub fn load_state_file(path: &Path) -> Result<Option<StateFile>, StateFileError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No state file at {}, starting empty", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let state: StateFile = serde_json::from_slice(&content)?;
    if state.version != STATE_FILE_VERSION {
        return Err(StateFileError::UnsupportedVersion {
            found: state.version,
            expected: STATE_FILE_VERSION,
        });
    }

    Ok(Some(state))
}

/// Append a finished run to the history file
///
/// The record is serialized to JSON on a single line followed by a newline.
pub fn append_run_history(record: &RunRecord, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

/// Load run records from a history file
///
/// The file should contain one JSON object per line, as produced by [append_run_history]. Blank
/// lines are ignored.
pub fn load_run_history(path: &Path) -> anyhow::Result<Vec<RunRecord>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let run: RunRecord = serde_json::from_str(&line)?;
        runs.push(run);
    }
    Ok(runs)
}
