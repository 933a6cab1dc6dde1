#![cfg(unix)]

use std::time::{Duration, Instant};

use disk_tunnel_orchestrator::orchestrator::AdmissionError;
use disk_tunnel_summary_model::{
    load_run_history, load_state_file, write_state_file, CheckOutcome, EnginePolicy, ErrorKind,
    MetricName, Phase, ReconcilePolicy, RunRecord, RunStatus, StateFile, Tier,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use tempfile::TempDir;

mod common;

use common::*;

#[tokio::test]
#[serial]
async fn completed_run_is_rated_with_monotonic_progress() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), &completing_engine_body());
    let orchestrator = open(&config(dir.path(), engine));

    let record = orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap();
    assert_eq!(record.status, RunStatus::Starting);

    let (record, progress) = wait_for_terminal(&orchestrator, &record.id).await;
    assert_eq!(record.status, RunStatus::Completed, "{record:?}");
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100.0));

    let metrics = record.metrics.clone().unwrap();
    assert_eq!(metrics.read_bandwidth_mbps, Some(650.0));
    assert_eq!(metrics.avg_read_latency_ms, Some(2.5));
    assert_eq!(metrics.stability_ratio, None);

    // Stability is required for excellent but absent, which does not disqualify
    let verdict = record.verdict.clone().unwrap();
    assert_eq!(verdict.tier, Tier::Excellent);
    assert_eq!(verdict.table_version, "test.1");
    assert!(verdict.breakdown.iter().any(|check| {
        check.metric == MetricName::StabilityRatio && check.outcome == CheckOutcome::Skipped
    }));

    assert_eq!(record.error, None);
    assert_eq!(record.eta_seconds, Some(0));
    assert!(record.engine_policy.is_some());
    assert!(record.raw_output.contains("[100.0%]"));

    // The test file is cleaned up
    assert_eq!(std::fs::read_dir(target.path()).unwrap().count(), 0);
}

#[tokio::test]
#[serial]
async fn second_start_is_busy_until_the_active_run_ends() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "sleep 600");
    let orchestrator = open(&config(dir.path(), engine));

    let first = orchestrator
        .start_run(start_request("slow", target.path()))
        .unwrap();

    let err = orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap_err();
    assert_eq!(
        err,
        AdmissionError::Busy {
            active_id: first.id.clone()
        }
    );

    // Busy wins over invalid input while a run is active
    let err = orchestrator
        .start_run(start_request("no_such_workload", target.path()))
        .unwrap_err();
    assert!(matches!(err, AdmissionError::Busy { .. }));

    orchestrator.stop_run(&first.id).unwrap();
    let (record, _) = wait_for_terminal(&orchestrator, &first.id).await;
    assert_eq!(record.status, RunStatus::Stopped);

    let second = orchestrator
        .start_run(start_request("slow", target.path()))
        .unwrap();
    assert_ne!(second.id, first.id);

    orchestrator.shutdown(Duration::from_secs(10)).await;
    assert_eq!(
        orchestrator.get_run(&second.id).unwrap().status,
        RunStatus::Stopped
    );
}

#[tokio::test]
#[serial]
async fn stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "sleep 600");
    let orchestrator = open(&config(dir.path(), engine));

    let record = orchestrator
        .start_run(start_request("slow", target.path()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let first = orchestrator.stop_run(&record.id).unwrap();
    let second = orchestrator.stop_run(&record.id).unwrap();
    assert!(first.accepted);
    assert!(second.accepted);

    let (stopped, _) = wait_for_terminal(&orchestrator, &record.id).await;
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert!(stopped.stop_requested);
    assert_eq!(stopped.verdict, None);

    let again = orchestrator.stop_run(&record.id).unwrap();
    assert!(!again.accepted);
    assert_eq!(again.status, RunStatus::Stopped);
    assert_eq!(
        orchestrator.get_run(&record.id).unwrap().status,
        RunStatus::Stopped
    );

    assert!(orchestrator.stop_run("unknown").is_err());
}

#[tokio::test]
#[serial]
async fn hung_engine_times_out() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "sleep 600");
    let orchestrator = open(&config(dir.path(), engine));

    let started = Instant::now();
    let record = orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap();
    let (record, _) = wait_for_terminal(&orchestrator, &record.id).await;
    let elapsed = started.elapsed();

    assert_eq!(record.status, RunStatus::Timeout);
    assert_eq!(record.error.map(|e| e.kind), Some(ErrorKind::Timeout));
    // 1s plan + 1s margin
    assert!(elapsed >= Duration::from_secs(2), "timed out after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "timed out after {elapsed:?}");
}

#[tokio::test]
#[serial]
async fn crashed_engine_fails_and_releases_the_slot() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(
        dir.path(),
        r#"echo "fio: io_u error on file: Input/output error" >&2
exit 1"#,
    );
    let orchestrator = open(&config(dir.path(), engine));

    let record = orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap();
    let (record, _) = wait_for_terminal(&orchestrator, &record.id).await;

    assert_eq!(record.status, RunStatus::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, ErrorKind::EngineCrashed);
    assert_eq!(error.exit_code, Some(1));
    assert_eq!(record.verdict, None);

    orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap();
    orchestrator.shutdown(Duration::from_secs(10)).await;
}

#[tokio::test]
#[serial]
async fn invalid_requests_report_every_problem() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "exit 0");
    let orchestrator = open(&config(dir.path(), engine));

    let mut request = start_request("no_such_workload", &dir.path().join("missing"));
    request.size_bytes = 1;

    let err = orchestrator.start_run(request).unwrap_err();
    let AdmissionError::InvalidInput { problems } = err else {
        panic!("expected invalid input");
    };
    assert_eq!(problems.len(), 3, "{problems:?}");
    assert!(problems[0].contains("no_such_workload"));
    assert!(problems[1].contains("outside the allowed range"));
    assert!(problems[2].contains("does not exist"));

    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, "").unwrap();
    let err = orchestrator
        .start_run(start_request("smoke", &file))
        .unwrap_err();
    assert!(err.to_string().contains("is not a directory"), "{err}");

    assert!(orchestrator.list_runs(10).is_empty());
}

#[tokio::test]
#[serial]
async fn restart_reconciles_active_runs() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "exit 0");
    let config = config(dir.path(), engine.clone());

    let mut running = RunRecord::new(
        "lost".to_string(),
        "smoke".to_string(),
        dir.path().to_path_buf(),
        1 << 20,
        vec![Phase {
            name: "seq_read".to_string(),
            duration_secs: 1,
            weight: 1.0,
        }],
    );
    running
        .mark_running(
            Some(4242),
            EnginePolicy {
                engine_path: engine,
                engine_version: None,
                ioengine: "psync".to_string(),
                direct_io: false,
                thread_mode: true,
                notes: Vec::new(),
            },
        )
        .unwrap();
    write_state_file(&config.state.path, &StateFile::new(vec![running])).unwrap();

    let orchestrator = open(&config);

    let record = orchestrator.get_run("lost").unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error.map(|e| e.kind), Some(ErrorKind::Interrupted));

    let on_disk = load_state_file(&config.state.path).unwrap().unwrap();
    assert_eq!(on_disk.runs[0].status, RunStatus::Failed);

    // Nothing is holding the slot
    let target = TempDir::new().unwrap();
    orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap();
    orchestrator.shutdown(Duration::from_secs(10)).await;
}

#[tokio::test]
#[serial]
async fn restart_can_reconcile_to_stopped() {
    let dir = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "exit 0");
    let mut config = config(dir.path(), engine);
    config.state.reconcile = ReconcilePolicy::Stopped;

    let starting = RunRecord::new(
        "lost".to_string(),
        "smoke".to_string(),
        dir.path().to_path_buf(),
        1 << 20,
        Vec::new(),
    );
    write_state_file(&config.state.path, &StateFile::new(vec![starting])).unwrap();

    let orchestrator = open(&config);
    let record = orchestrator.get_run("lost").unwrap();
    assert_eq!(record.status, RunStatus::Stopped);
    assert_eq!(record.error, None);
}

#[tokio::test]
#[serial]
async fn completed_run_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), &completing_engine_body());
    let config = config(dir.path(), engine);
    let orchestrator = open(&config);

    let record = orchestrator
        .start_run(start_request("smoke", target.path()))
        .unwrap();
    wait_for_terminal(&orchestrator, &record.id).await;
    orchestrator.shutdown(Duration::from_secs(10)).await;
    let before = orchestrator.get_run(&record.id).unwrap();

    let reopened = open(&config);
    let after = reopened.get_run(&record.id).unwrap();
    assert_eq!(after, before);
    assert_eq!(after.pid, None);

    let history = load_run_history(config.state.history_path.as_ref().unwrap()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], before);
}

#[tokio::test]
#[serial]
async fn finished_runs_can_be_listed_and_removed() {
    let dir = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let engine = fake_engine(dir.path(), "exit 3");
    let orchestrator = open(&config(dir.path(), engine));

    let mut ids = Vec::new();
    for _ in 0..3 {
        let record = orchestrator
            .start_run(start_request("smoke", target.path()))
            .unwrap();
        wait_for_terminal(&orchestrator, &record.id).await;
        ids.push(record.id);
    }
    orchestrator.shutdown(Duration::from_secs(10)).await;

    let listed: Vec<String> = orchestrator.list_runs(2).into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);

    orchestrator.remove_run(&ids[0]).unwrap();
    assert!(orchestrator.get_run(&ids[0]).is_none());
    assert_eq!(orchestrator.list_runs(10).len(), 2);
}
