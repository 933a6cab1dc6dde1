use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Platform compatibility decisions applied to the engine invocation for one run.
///
/// Recorded on the run so that an operator looking at a failed or surprising result can see
/// exactly how the engine was configured and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePolicy {
    pub engine_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    /// The engine's I/O backend, e.g. `libaio` or `posixaio`.
    pub ioengine: String,
    /// Whether the page cache is bypassed.
    pub direct_io: bool,
    /// Run sub-jobs as threads instead of forked processes, which avoids SysV shared memory.
    pub thread_mode: bool,
    /// One line per decision explaining why it was taken.
    #[serde(default)]
    pub notes: Vec<String>,
}
