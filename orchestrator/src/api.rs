//! HTTP interface over the [Orchestrator].
//!
//! Bodies are JSON with camelCase keys. Errors share one shape,
//! `{status, code, detail, problems?, activeId?}`, where `code` is stable and safe to match on.

use std::path::PathBuf;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use disk_tunnel_summary_model::{
    CheckOutcome, Comparator, EnginePolicy, ErrorKind, MetricCheck, MetricName, NormalizedMetrics,
    Phase, RunError, RunRecord, RunStatus, RunSummary, Tier, Verdict,
};
use serde::{Deserialize, Serialize};

use crate::orchestrator::{AdmissionError, Orchestrator, StartRequest};
use crate::registry::RegistryError;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 500;

pub fn router(orchestrator: Orchestrator) -> Router {
    let api = Router::new()
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{id}", get(get_run).delete(remove_run))
        .route("/runs/{id}/stop", post(stop_run))
        .route("/workloads", get(list_workloads));

    Router::new()
        .route("/livez", get(livez))
        .nest("/api/v1", api)
        .with_state(orchestrator)
}

async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunBody {
    pub workload_type: String,
    pub target_path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub id: String,
    pub status: RunStatus,
}

async fn start_run(
    State(orchestrator): State<Orchestrator>,
    body: Result<Json<StartRunBody>, JsonRejection>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    let Json(body) = body.map_err(|e| ApiError::InvalidBody(e.body_text()))?;

    let record = orchestrator.start_run(StartRequest {
        workload_type: body.workload_type,
        target_path: body.target_path,
        size_bytes: body.size_bytes,
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            id: record.id,
            status: record.status,
        }),
    ))
}

async fn get_run(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<Json<RunView>, ApiError> {
    orchestrator
        .get_run(&id)
        .map(|record| Json(RunView::from(&record)))
        .ok_or(ApiError::Registry(RegistryError::NotFound(id)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummaryView>,
}

async fn list_runs(
    State(orchestrator): State<Orchestrator>,
    Query(query): Query<ListQuery>,
) -> Json<ListRunsResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let runs = orchestrator
        .list_runs(limit)
        .into_iter()
        .map(RunSummaryView::from)
        .collect();

    Json(ListRunsResponse { runs })
}

#[derive(Debug, Serialize)]
pub struct StopRunResponse {
    pub accepted: bool,
    pub status: RunStatus,
}

async fn stop_run(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<Json<StopRunResponse>, ApiError> {
    let ack = orchestrator.stop_run(&id)?;
    Ok(Json(StopRunResponse {
        accepted: ack.accepted,
        status: ack.status,
    }))
}

async fn remove_run(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    orchestrator.remove_run(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Workloads
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkloadsResponse {
    pub thresholds_version: String,
    pub workloads: Vec<WorkloadView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadView {
    pub name: String,
    pub description: String,
    pub planned_duration_secs: u64,
    pub phases: Vec<PhaseView>,
    /// Tiers this workload can earn, best first.
    pub tiers: Vec<Tier>,
}

async fn list_workloads(State(orchestrator): State<Orchestrator>) -> Json<ListWorkloadsResponse> {
    let thresholds = orchestrator.thresholds();
    let catalog = orchestrator.catalog();

    let workloads = catalog
        .workloads()
        .into_iter()
        .filter_map(|name| {
            let plan = catalog.plan(&name)?;
            let mut tiers: Vec<Tier> = thresholds
                .tiers(&name)
                .unwrap_or_default()
                .iter()
                .map(|spec| spec.tier)
                .collect();
            tiers.sort_by(|a, b| b.cmp(a));

            Some(WorkloadView {
                planned_duration_secs: plan.total_duration_secs(),
                phases: plan.to_phases().iter().map(PhaseView::from).collect(),
                description: plan.description,
                tiers,
                name,
            })
        })
        .collect();

    Json(ListWorkloadsResponse {
        thresholds_version: thresholds.version().to_string(),
        workloads,
    })
}

// ============================================================================
// Views
// ============================================================================

/// Full projection of a run for pollers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub id: String,
    pub workload_type: String,
    pub target_path: PathBuf,
    pub size_bytes: u64,
    pub status: RunStatus,
    pub progress_percent: f64,
    pub current_phase_index: usize,
    pub current_phase: Option<String>,
    pub phases: Vec<PhaseView>,
    pub elapsed_seconds: u64,
    pub eta_seconds: Option<u64>,
    pub stop_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_policy: Option<EnginePolicyView>,
    pub output_tail: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&RunRecord> for RunView {
    fn from(record: &RunRecord) -> Self {
        Self {
            id: record.id.clone(),
            workload_type: record.workload_type.clone(),
            target_path: record.target_path.clone(),
            size_bytes: record.size_bytes,
            status: record.status,
            progress_percent: record.progress_percent,
            current_phase_index: record.current_phase_index,
            current_phase: record.current_phase().map(|p| p.name.clone()),
            phases: record.phases.iter().map(PhaseView::from).collect(),
            elapsed_seconds: record.elapsed_seconds,
            eta_seconds: record.eta_seconds,
            stop_requested: record.stop_requested,
            metrics: record.metrics.as_ref().map(MetricsView::from),
            verdict: record.verdict.as_ref().map(VerdictView::from),
            error: record.error.as_ref().map(ErrorView::from),
            engine_policy: record.engine_policy.as_ref().map(EnginePolicyView::from),
            output_tail: record.raw_output.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummaryView {
    pub id: String,
    pub workload_type: String,
    pub status: RunStatus,
    pub progress_percent: f64,
    pub tier: Option<Tier>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RunSummary> for RunSummaryView {
    fn from(summary: RunSummary) -> Self {
        Self {
            id: summary.id,
            workload_type: summary.workload_type,
            status: summary.status,
            progress_percent: summary.progress_percent,
            tier: summary.tier,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseView {
    pub name: String,
    pub duration_secs: u64,
    pub weight: f64,
}

impl From<&Phase> for PhaseView {
    fn from(phase: &Phase) -> Self {
        Self {
            name: phase.name.clone(),
            duration_secs: phase.duration_secs,
            weight: phase.weight,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsView {
    #[serde(rename = "readBandwidthMBps")]
    pub read_bandwidth_mbps: Option<f64>,
    #[serde(rename = "writeBandwidthMBps")]
    pub write_bandwidth_mbps: Option<f64>,
    #[serde(rename = "readIOPS")]
    pub read_iops: Option<f64>,
    #[serde(rename = "writeIOPS")]
    pub write_iops: Option<f64>,
    #[serde(rename = "avgReadLatencyMs")]
    pub avg_read_latency_ms: Option<f64>,
    #[serde(rename = "avgWriteLatencyMs")]
    pub avg_write_latency_ms: Option<f64>,
    #[serde(rename = "stabilityRatio")]
    pub stability_ratio: Option<f64>,
}

impl From<&NormalizedMetrics> for MetricsView {
    fn from(metrics: &NormalizedMetrics) -> Self {
        Self {
            read_bandwidth_mbps: metrics.read_bandwidth_mbps,
            write_bandwidth_mbps: metrics.write_bandwidth_mbps,
            read_iops: metrics.read_iops,
            write_iops: metrics.write_iops,
            avg_read_latency_ms: metrics.avg_read_latency_ms,
            avg_write_latency_ms: metrics.avg_write_latency_ms,
            stability_ratio: metrics.stability_ratio,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictView {
    pub tier: Tier,
    pub recommendation: String,
    pub breakdown: Vec<CheckView>,
    pub table_version: String,
    pub table_digest: String,
}

impl From<&Verdict> for VerdictView {
    fn from(verdict: &Verdict) -> Self {
        Self {
            tier: verdict.tier,
            recommendation: verdict.recommendation.clone(),
            breakdown: verdict.breakdown.iter().map(CheckView::from).collect(),
            table_version: verdict.table_version.clone(),
            table_digest: verdict.table_digest.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckView {
    pub tier: Tier,
    /// Threshold table name of the metric, e.g. `read_bw_mb`.
    pub metric: MetricName,
    pub comparator: Comparator,
    pub bound: f64,
    pub observed: Option<f64>,
    pub outcome: CheckOutcome,
}

impl From<&MetricCheck> for CheckView {
    fn from(check: &MetricCheck) -> Self {
        Self {
            tier: check.tier,
            metric: check.metric,
            comparator: check.comparator,
            bound: check.bound,
            observed: check.observed,
            outcome: check.outcome,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorView {
    pub kind: ErrorKind,
    pub message: String,
    pub exit_code: Option<i32>,
    pub output_fragment: Option<String>,
}

impl From<&RunError> for ErrorView {
    fn from(error: &RunError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            exit_code: error.exit_code,
            output_fragment: error.output_fragment.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginePolicyView {
    pub engine_path: PathBuf,
    pub engine_version: Option<String>,
    pub ioengine: String,
    pub direct_io: bool,
    pub thread_mode: bool,
    pub notes: Vec<String>,
}

impl From<&EnginePolicy> for EnginePolicyView {
    fn from(policy: &EnginePolicy) -> Self {
        Self {
            engine_path: policy.engine_path.clone(),
            engine_version: policy.engine_version.clone(),
            ioengine: policy.ioengine.clone(),
            direct_io: policy.direct_io,
            thread_mode: policy.thread_mode,
            notes: policy.notes.clone(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    InvalidBody(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    status: u16,
    code: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    problems: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.to_string();
        let (status, code, problems, active_id) = match self {
            ApiError::Admission(AdmissionError::Busy { active_id }) => {
                (StatusCode::CONFLICT, "busy", None, Some(active_id))
            }
            ApiError::Admission(AdmissionError::InvalidInput { problems }) => {
                (StatusCode::BAD_REQUEST, "invalid_input", Some(problems), None)
            }
            ApiError::InvalidBody(problem) => (
                StatusCode::BAD_REQUEST,
                "invalid_input",
                Some(vec![problem]),
                None,
            ),
            ApiError::Registry(RegistryError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found", None, None)
            }
            ApiError::Registry(RegistryError::Active(id)) => {
                (StatusCode::CONFLICT, "active", None, Some(id))
            }
            ApiError::Registry(RegistryError::Busy { active_id }) => {
                (StatusCode::CONFLICT, "busy", None, Some(active_id))
            }
            ApiError::Registry(RegistryError::Transition(_)) => {
                (StatusCode::CONFLICT, "conflict", None, None)
            }
        };

        let body = ErrorBody {
            status: status.as_u16(),
            code,
            detail,
            problems,
            active_id,
        };

        (status, Json(body)).into_response()
    }
}
