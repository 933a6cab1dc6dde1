#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use disk_tunnel_orchestrator::catalog::WorkloadCatalog;
use disk_tunnel_orchestrator::config::Config;
use disk_tunnel_orchestrator::orchestrator::{Orchestrator, StartRequest};
use disk_tunnel_summary_model::RunRecord;
use disk_tunnel_thresholds::ThresholdTable;

pub const CATALOG: &str = r#"
[workloads.smoke]
description = "One second of sequential reads"

[[workloads.smoke.phases]]
name = "seq_read"
duration_secs = 1
options = { rw = "read", bs = "1M" }

[workloads.slow]
description = "A minute of sequential reads"

[[workloads.slow.phases]]
name = "seq_read"
duration_secs = 60
options = { rw = "read", bs = "1M" }
"#;

pub const THRESHOLDS: &str = r#"
version = "test.1"

[[workloads.smoke]]
tier = "excellent"
recommendation = "Fast enough for anything"
requirements = [
    { metric = "read_bw_mb", op = ">=", bound = 600.0 },
    { metric = "stability_ratio", op = ">=", bound = 0.9 },
]

[[workloads.smoke]]
tier = "minimum"
recommendation = "Just about usable"
requirements = [{ metric = "read_bw_mb", op = ">=", bound = 100.0 }]

[[workloads.slow]]
tier = "minimum"
recommendation = "Just about usable"
requirements = [{ metric = "read_bw_mb", op = ">=", bound = 100.0 }]
"#;

/// Two read sub-jobs of 325 MiB/s each and no `bw_min`, so no stability ratio.
pub const PAYLOAD: &str = r#"{
  "fio version": "fio-3.36",
  "jobs": [
    {
      "jobname": "seq_read",
      "error": 0,
      "read": {"io_bytes": 1048576, "bw": 332800, "iops": 325.0, "lat_ns": {"mean": 2000000.0, "N": 10}},
      "write": {"io_bytes": 0, "bw": 0, "iops": 0.0}
    },
    {
      "jobname": "seq_read",
      "error": 0,
      "read": {"io_bytes": 1048576, "bw": 332800, "iops": 325.0, "lat_ns": {"mean": 3000000.0, "N": 10}},
      "write": {"io_bytes": 0, "bw": 0, "iops": 0.0}
    }
  ]
}"#;

/// An engine that reports progress for a little over a second and then writes [PAYLOAD].
pub fn completing_engine_body() -> String {
    format!(
        r#"echo "Jobs: 1 (f=1): [R(1)][20.0%][r=650MiB/s][eta 00m:01s]"
sleep 0.4
echo "Jobs: 1 (f=1): [R(1)][60.0%][r=650MiB/s][eta 00m:01s]"
sleep 0.4
echo "Jobs: 1 (f=1): [R(1)][100.0%][r=650MiB/s][eta 00m:00s]"
sleep 0.3
cat > "$out" <<'JSON'
{PAYLOAD}
JSON
exit 0"#
    )
}

/// Write a shell script that behaves like fio: it answers `--version`, finds the `--output=`
/// argument and then runs `body` with the output path in `$out`.
pub fn fake_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fio");
    let script = format!(
        r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --version) echo "fio-3.36"; exit 0 ;;
    --output=*) out="${{arg#--output=}}" ;;
  esac
done
{body}
"#
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn config(state_dir: &Path, engine: PathBuf) -> Config {
    let mut config = Config::default();
    config.engine.path = Some(engine);
    config.engine.timeout_margin_secs = 1;
    config.engine.stop_grace_secs = 2;
    config.engine.progress_interval_ms = 100;
    config.admission.min_size_bytes = 1024;
    config.admission.check_free_space = false;
    config.state.path = state_dir.join("state.json");
    config.state.history_path = Some(state_dir.join("history.jsonl"));
    config.state.persist_interval_secs = 0;
    config
}

pub fn open(config: &Config) -> Orchestrator {
    Orchestrator::open(
        config,
        Arc::new(WorkloadCatalog::from_toml_str(CATALOG).unwrap()),
        ThresholdTable::from_toml_str(THRESHOLDS).unwrap(),
    )
    .unwrap()
}

pub fn start_request(workload: &str, target: &Path) -> StartRequest {
    StartRequest {
        workload_type: workload.to_string(),
        target_path: target.to_path_buf(),
        size_bytes: 1 << 20,
    }
}

/// Poll a run until it is terminal, returning the final record and every progress value seen.
pub async fn wait_for_terminal(orchestrator: &Orchestrator, id: &str) -> (RunRecord, Vec<f64>) {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut progress = Vec::new();

    loop {
        let record = orchestrator.get_run(id).expect("run should exist");
        progress.push(record.progress_percent);
        if record.status.is_terminal() {
            return (record, progress);
        }

        assert!(
            Instant::now() < deadline,
            "run {id} did not finish in time: {record:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
