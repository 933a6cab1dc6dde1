//! Decode fio result payloads into [NormalizedMetrics].
//!
//! All unit conversion and field fallback logic lives here so that threshold evaluation only
//! ever sees one canonical shape.

mod payload;

use disk_tunnel_summary_model::NormalizedMetrics;
use payload::{Payload, Section};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Payload has no top-level jobs collection")]
    MissingJobs,
    #[error("Payload jobs collection is empty")]
    NoJobs,
    #[error("Payload contains no usable metrics")]
    NoMetrics,
}

/// What was read from a result payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReport {
    /// Engine version string reported in the payload, e.g. `fio-3.36`.
    pub engine_version: Option<String>,
    /// Names of the sub-jobs, in payload order.
    pub job_names: Vec<String>,
    /// Sub-jobs which reported a non-zero error code.
    pub failed_jobs: Vec<String>,
    pub metrics: NormalizedMetrics,
}

/// Parse a fio JSON payload.
///
/// Anything printed before the first `{` is skipped, since fio writes warnings ahead of the JSON
/// document on some platforms.
pub fn parse_payload(raw: &str) -> Result<TelemetryReport, ParseError> {
    let json = raw.find('{').map(|start| &raw[start..]).unwrap_or(raw);
    let payload: Payload = serde_json::from_str(json)?;

    let jobs = payload.jobs.ok_or(ParseError::MissingJobs)?;
    if jobs.is_empty() {
        return Err(ParseError::NoJobs);
    }

    let job_names = jobs
        .iter()
        .enumerate()
        .map(|(i, job)| job.jobname.clone().unwrap_or_else(|| format!("job{i}")))
        .collect::<Vec<_>>();
    let failed_jobs = jobs
        .iter()
        .zip(&job_names)
        .filter(|(job, _)| job.error != 0)
        .map(|(_, name)| name.clone())
        .collect::<Vec<_>>();

    let reads = jobs.iter().filter_map(|j| j.read.as_ref()).collect::<Vec<_>>();
    let writes = jobs.iter().filter_map(|j| j.write.as_ref()).collect::<Vec<_>>();

    let metrics = NormalizedMetrics {
        read_bandwidth_mbps: sum_present(reads.iter().map(|s| s.bandwidth_mbps())),
        write_bandwidth_mbps: sum_present(writes.iter().map(|s| s.bandwidth_mbps())),
        read_iops: sum_present(reads.iter().map(|s| s.iops())),
        write_iops: sum_present(writes.iter().map(|s| s.iops())),
        avg_read_latency_ms: mean_present(
            reads
                .iter()
                .filter(|s| s.is_active())
                .map(|s| s.mean_latency_ms()),
        ),
        avg_write_latency_ms: mean_present(
            writes
                .iter()
                .filter(|s| s.is_active())
                .map(|s| s.mean_latency_ms()),
        ),
        stability_ratio: stability_ratio(reads.iter().chain(writes.iter()).copied()),
    };

    if metrics.is_empty() {
        return Err(ParseError::NoMetrics);
    }

    log::debug!(
        "Parsed {} job(s) from {} payload",
        job_names.len(),
        payload.fio_version.as_deref().unwrap_or("unknown engine")
    );

    Ok(TelemetryReport {
        engine_version: payload.fio_version,
        job_names,
        failed_jobs,
        metrics,
    })
}

/// Sum of the present values, `None` if no value was present.
fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

fn mean_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// `sum(bw_min) / sum(bw_mean)` over the active sections which report both.
fn stability_ratio<'a>(sections: impl Iterator<Item = &'a Section>) -> Option<f64> {
    let (min_sum, mean_sum, count) = sections
        .filter(|s| s.is_active())
        .filter_map(|s| Some((s.bw_min?, s.bw_mean?)))
        .fold((0.0, 0.0, 0usize), |(min_sum, mean_sum, count), (min, mean)| {
            (min_sum + min, mean_sum + mean, count + 1)
        });

    if count == 0 || mean_sum <= 0.0 {
        return None;
    }

    Some(min_sum / mean_sum)
}
