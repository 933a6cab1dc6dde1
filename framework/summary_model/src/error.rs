use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a run ended in `failed` or `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The engine binary could not be found on any configured search path.
    EngineMissing,
    /// The engine exited non-zero or was killed by a signal.
    EngineCrashed,
    /// The engine exited cleanly but its result payload could not be used.
    OutputUnparseable,
    /// The engine or the launch step was refused access to the target or the binary.
    PermissionDenied,
    /// The run exceeded its wall-clock budget and was force-terminated.
    Timeout,
    /// The engine could not be started within the launch grace period.
    LaunchFailed,
    /// The controller restarted while the run was active, so its process was lost.
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EngineMissing => "engine_missing",
            ErrorKind::EngineCrashed => "engine_crashed",
            ErrorKind::OutputUnparseable => "output_unparseable",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure cause stored on a run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// The last few lines the engine printed before it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_fragment: Option<String>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            output_fragment: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_output_fragment(mut self, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        if !fragment.is_empty() {
            self.output_fragment = Some(fragment);
        }
        self
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}
