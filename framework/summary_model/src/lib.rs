//! Run records, verdicts and the durable state file shared by the Disk Tunnel crates.

mod error;
mod metrics;
mod policy;
mod run;
mod state_file;
mod verdict;

pub use error::{ErrorKind, RunError};
pub use metrics::{MetricName, NormalizedMetrics};
pub use policy::EnginePolicy;
pub use run::{
    Phase, ProgressUpdate, ReconcilePolicy, RunRecord, RunStatus, RunSummary, Termination,
    TransitionError,
};
pub use state_file::{
    append_run_history, load_run_history, load_state_file, write_state_file, StateFile,
    StateFileError, STATE_FILE_VERSION,
};
pub use verdict::{CheckOutcome, Comparator, MetricCheck, Tier, Verdict};
