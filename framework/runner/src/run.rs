use std::path::{Path, PathBuf};
use std::time::Duration;

use disk_tunnel_core::prelude::ShutdownListener;
use disk_tunnel_summary_model::{
    EnginePolicy, ErrorKind, NormalizedMetrics, ProgressUpdate, RunError,
};
use disk_tunnel_telemetry::{parse_payload, TelemetryReport};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::compat::{select_policy, Platform, PolicyOverrides};
use crate::engine::{fio_path, fio_version};
use crate::jobfile::render_job_file;
use crate::plan::PhasePlan;
use crate::process::EngineProcess;
use crate::progress::ProgressTracker;
use crate::tail::OutputTail;

/// Lines of engine output attached to an error.
const ERROR_FRAGMENT_LINES: usize = 20;

/// How long to keep reading output after the engine has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest wait for `fio --version` during launch.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Configured fio binary, used when `DT_FIO_PATH` is not set.
    pub engine_path: Option<PathBuf>,
    /// Added to the planned duration to get the hard wall-clock limit.
    pub timeout_margin: Duration,
    /// How long the engine gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
    /// Limit on discovery, job file rendering and spawning together.
    pub launch_grace: Duration,
    pub progress_interval: Duration,
    pub output_tail_bytes: usize,
    pub policy_overrides: PolicyOverrides,
    /// Leave the engine's test file on the target after the run.
    pub keep_test_file: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine_path: None,
            timeout_margin: Duration::from_secs(120),
            stop_grace: Duration::from_secs(10),
            launch_grace: Duration::from_secs(30),
            progress_interval: Duration::from_secs(1),
            output_tail_bytes: 64 * 1024,
            policy_overrides: PolicyOverrides::default(),
            keep_test_file: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub target_path: PathBuf,
    pub size_bytes: u64,
    pub plan: PhasePlan,
}

impl RunRequest {
    /// The file the engine reads and writes on the target.
    pub fn test_file(&self) -> PathBuf {
        self.target_path.join(format!("disk-tunnel-{}.dat", self.run_id))
    }
}

/// Receives updates from a run while it is in flight.
///
/// Called from the monitoring task only, at most once per progress interval for
/// [ProgressSink::progress].
pub trait ProgressSink: Send + Sync {
    /// The engine process is running.
    fn launched(&self, pid: Option<u32>, policy: &EnginePolicy);

    fn progress(&self, update: ProgressUpdate);
}

/// How a run ended, from the runner's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        report: TelemetryReport,
        output_tail: String,
    },
    Failed {
        error: RunError,
        metrics: Option<NormalizedMetrics>,
        output_tail: String,
    },
    TimedOut {
        error: RunError,
        metrics: Option<NormalizedMetrics>,
        output_tail: String,
    },
    Stopped {
        output_tail: String,
    },
}

impl RunOutcome {
    fn launch_failure(error: RunError) -> Self {
        RunOutcome::Failed {
            error,
            metrics: None,
            output_tail: String::new(),
        }
    }
}

struct Launched {
    process: EngineProcess,
    result_path: PathBuf,
    // Holds the job file and the result payload, removed on drop
    _work_dir: tempfile::TempDir,
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Stopped,
}

/// Run the engine for one request and supervise it until it ends.
///
/// Never panics on engine failure. Every failure is reported as a [RunOutcome] and the engine
/// process is always reaped before this returns.
pub async fn run_engine(
    request: &RunRequest,
    config: &RunnerConfig,
    sink: &dyn ProgressSink,
    mut cancel: ShutdownListener,
) -> RunOutcome {
    if cancel.should_shutdown() {
        log::info!("Run {} was stopped before launch", request.run_id);
        return RunOutcome::Stopped {
            output_tail: String::new(),
        };
    }

    let launched = tokio::select! {
        result = tokio::time::timeout(config.launch_grace, launch(request, config, sink)) => {
            match result {
                Ok(Ok(launched)) => launched,
                Ok(Err(error)) => {
                    log::warn!("Run {} failed to launch: {error}", request.run_id);
                    return RunOutcome::launch_failure(error);
                }
                Err(_) => {
                    let error = RunError::new(
                        ErrorKind::LaunchFailed,
                        format!(
                            "Engine did not start within {}s",
                            config.launch_grace.as_secs_f64()
                        ),
                    );
                    log::warn!("Run {} failed to launch: {error}", request.run_id);
                    return RunOutcome::launch_failure(error);
                }
            }
        }
        _ = cancel.wait_for_shutdown() => {
            log::info!("Run {} stopped before the engine started", request.run_id);
            return RunOutcome::Stopped { output_tail: String::new() };
        }
    };

    let outcome = supervise(request, config, sink, cancel, launched).await;

    if !config.keep_test_file {
        remove_test_file(&request.test_file()).await;
    }

    outcome
}

async fn launch(
    request: &RunRequest,
    config: &RunnerConfig,
    sink: &dyn ProgressSink,
) -> Result<Launched, RunError> {
    let engine_path = fio_path(config.engine_path.as_deref())
        .map_err(|e| RunError::new(ErrorKind::EngineMissing, format!("{e:#}")))?;

    let version = fio_version(&engine_path, VERSION_PROBE_TIMEOUT.min(config.launch_grace)).await;
    let policy = select_policy(
        engine_path,
        version,
        &Platform::detect(),
        &config.policy_overrides,
    );
    for note in &policy.notes {
        log::info!("Run {}: {note}", request.run_id);
    }

    let launch_failed = |context: &str, e: &dyn std::fmt::Display| {
        RunError::new(ErrorKind::LaunchFailed, format!("{context}: {e}"))
    };

    let work_dir = tempfile::Builder::new()
        .prefix("disk-tunnel-")
        .tempdir()
        .map_err(|e| launch_failed("Failed to create work directory", &e))?;

    let job = render_job_file(
        &request.run_id,
        &request.test_file(),
        request.size_bytes,
        &request.plan,
        &policy,
    )
    .map_err(|e| launch_failed("Failed to render job file", &e))?;

    let job_path = work_dir.path().join("job.fio");
    tokio::fs::write(&job_path, job)
        .await
        .map_err(|e| launch_failed("Failed to write job file", &e))?;

    let result_path = work_dir.path().join("result.json");

    let mut command = Command::new(&policy.engine_path);
    command
        .arg("--output-format=json")
        .arg(format!("--output={}", result_path.display()))
        .arg("--eta=always")
        .arg("--eta-newline=1")
        .arg(&job_path)
        .current_dir(work_dir.path());

    let process = EngineProcess::spawn(command).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RunError::new(
            ErrorKind::EngineMissing,
            format!("fio binary {} not found: {e}", policy.engine_path.display()),
        ),
        std::io::ErrorKind::PermissionDenied => RunError::new(
            ErrorKind::PermissionDenied,
            format!("Not allowed to execute {}: {e}", policy.engine_path.display()),
        ),
        _ => launch_failed("Failed to start fio", &e),
    })?;

    log::info!(
        "Run {} started fio with pid {:?}",
        request.run_id,
        process.pid()
    );
    sink.launched(process.pid(), &policy);

    Ok(Launched {
        process,
        result_path,
        _work_dir: work_dir,
    })
}

async fn supervise(
    request: &RunRequest,
    config: &RunnerConfig,
    sink: &dyn ProgressSink,
    mut cancel: ShutdownListener,
    launched: Launched,
) -> RunOutcome {
    let Launched {
        mut process,
        result_path,
        _work_dir,
    } = launched;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = process.take_stdout() {
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = process.take_stderr() {
        tokio::spawn(forward_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let log_target = format!("fio::{}", request.run_id);
    let mut tracker = ProgressTracker::new(&request.plan);
    let mut tail = OutputTail::new(config.output_tail_bytes);

    let budget = tracker.planned_duration() + config.timeout_margin;
    let started = Instant::now();
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(config.progress_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ending = loop {
        tokio::select! {
            status = process.wait() => break Ending::Exited(status),
            _ = &mut deadline => {
                log::warn!(
                    "Run {} exceeded its {}s budget, terminating engine",
                    request.run_id,
                    budget.as_secs()
                );
                process.terminate(config.stop_grace).await;
                break Ending::TimedOut;
            }
            _ = cancel.wait_for_shutdown() => {
                log::info!("Run {} stop requested, terminating engine", request.run_id);
                process.terminate(config.stop_grace).await;
                break Ending::Stopped;
            }
            Some(line) = line_rx.recv() => {
                record_line(&mut tracker, &mut tail, &log_target, &line);
            }
            _ = ticker.tick() => {
                sink.progress(tracker.snapshot(started.elapsed(), Some(tail.contents())));
            }
        }
    };

    // Pick up whatever the engine printed on its way out
    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        while let Some(line) = line_rx.recv().await {
            record_line(&mut tracker, &mut tail, &log_target, &line);
        }
    })
    .await;

    let output_tail = tail.contents();
    let fragment = tail.last_lines(ERROR_FRAGMENT_LINES);

    match ending {
        Ending::Stopped => RunOutcome::Stopped { output_tail },
        Ending::TimedOut => RunOutcome::TimedOut {
            error: RunError::new(
                ErrorKind::Timeout,
                format!(
                    "Run exceeded its {}s budget ({}s planned + {}s margin) and was terminated",
                    budget.as_secs(),
                    tracker.planned_duration().as_secs(),
                    config.timeout_margin.as_secs()
                ),
            )
            .with_output_fragment(fragment),
            metrics: read_partial_metrics(&result_path).await,
            output_tail,
        },
        Ending::Exited(Err(e)) => RunOutcome::Failed {
            error: RunError::new(
                ErrorKind::EngineCrashed,
                format!("Failed to wait for engine: {e}"),
            )
            .with_output_fragment(fragment),
            metrics: read_partial_metrics(&result_path).await,
            output_tail,
        },
        Ending::Exited(Ok(status)) if status.success() => {
            match read_report(&result_path).await {
                Ok(report) => {
                    if !report.failed_jobs.is_empty() {
                        log::warn!(
                            "Run {} completed but fio reported errors in jobs: {}",
                            request.run_id,
                            report.failed_jobs.join(", ")
                        );
                    }
                    RunOutcome::Completed {
                        report,
                        output_tail,
                    }
                }
                Err(message) => RunOutcome::Failed {
                    error: RunError::new(ErrorKind::OutputUnparseable, message)
                        .with_exit_code(status.code())
                        .with_output_fragment(fragment),
                    metrics: None,
                    output_tail,
                },
            }
        }
        Ending::Exited(Ok(status)) => {
            let kind = if tail.contains("Permission denied") || tail.contains("EACCES") {
                ErrorKind::PermissionDenied
            } else {
                ErrorKind::EngineCrashed
            };

            RunOutcome::Failed {
                error: RunError::new(kind, format!("fio exited with {status}"))
                    .with_exit_code(status.code())
                    .with_output_fragment(fragment),
                metrics: read_partial_metrics(&result_path).await,
                output_tail,
            }
        }
    }
}

fn record_line(tracker: &mut ProgressTracker, tail: &mut OutputTail, log_target: &str, line: &str) {
    if log::log_enabled!(target: log_target, log::Level::Debug) {
        log::debug!(target: log_target, "{line}");
    }
    tracker.observe_line(line);
    tail.push(line);
}

/// Forward engine output line by line until EOF.
///
/// Lines are decoded lossily. The pipe stays open on bytes that are not UTF-8, since closing it
/// early would kill the engine with SIGPIPE on its next write.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("Stopped reading engine output: {e}");
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn read_report(path: &Path) -> Result<TelemetryReport, String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err("Engine exited successfully but wrote no result payload".to_string());
        }
        Err(e) => return Err(format!("Failed to read result payload: {e}")),
    };

    parse_payload(&content).map_err(|e| format!("Result payload is unusable: {e}"))
}

async fn read_partial_metrics(path: &Path) -> Option<NormalizedMetrics> {
    match read_report(path).await {
        Ok(report) => Some(report.metrics),
        Err(message) => {
            log::debug!("No partial metrics available: {message}");
            None
        }
    }
}

async fn remove_test_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed test file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove test file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_line_strips_endings_and_replaces_bad_bytes() {
        assert_eq!(decode_line(b"Jobs: 1\r\n"), "Jobs: 1");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"on \xff\xfe disk\n"), "on \u{FFFD}\u{FFFD} disk");
    }
}
