//! Launches fio for one run at a time and supervises it to the end.

mod compat;
mod engine;
mod jobfile;
mod plan;
mod process;
mod progress;
mod run;
mod tail;

pub mod prelude {
    pub use crate::compat::{select_policy, Platform, PolicyOverrides};
    pub use crate::engine::{fio_path, fio_version, DT_FIO_PATH_ENV};
    pub use crate::jobfile::{render_job_file, JobFileError};
    pub use crate::plan::{PhasePlan, PhaseSpec, PlanSource};
    pub use crate::progress::{parse_engine_percent, ProgressTracker};
    pub use crate::run::{run_engine, ProgressSink, RunOutcome, RunRequest, RunnerConfig};
}
