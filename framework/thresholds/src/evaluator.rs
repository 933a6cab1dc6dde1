use disk_tunnel_summary_model::{CheckOutcome, MetricCheck, NormalizedMetrics, Tier, Verdict};

use crate::table::{ThresholdTable, TierSpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("No thresholds defined for workload '{0}'")]
    UnknownWorkload(String),
}

/// Rate a run's metrics against the tiers defined for its workload.
///
/// Tiers are walked from best to worst and the first one whose requirements all hold is
/// selected. A requirement on a metric the run did not report is skipped rather than failed,
/// so partial data can still earn a tier. When no tier is satisfied the verdict is
/// [Tier::Insufficient].
pub fn evaluate(
    table: &ThresholdTable,
    workload: &str,
    metrics: &NormalizedMetrics,
) -> Result<Verdict, EvaluationError> {
    let tiers = table
        .tiers(workload)
        .ok_or_else(|| EvaluationError::UnknownWorkload(workload.to_string()))?;

    let mut breakdown = Vec::new();
    let mut selected: Option<&TierSpec> = None;

    for tier in Tier::RANKED {
        let Some(spec) = tiers.iter().find(|s| s.tier == tier) else {
            continue;
        };

        let checks = check_tier(spec, metrics);
        let satisfied = checks.iter().all(|c| c.outcome != CheckOutcome::Failed);
        breakdown.extend(checks);

        if satisfied {
            selected = Some(spec);
            break;
        }
    }

    let (tier, recommendation) = match selected {
        Some(spec) => (spec.tier, spec.recommendation.clone()),
        None => (
            Tier::Insufficient,
            table.insufficient_recommendation().to_string(),
        ),
    };

    let skipped = breakdown
        .iter()
        .filter(|c| c.outcome == CheckOutcome::Skipped)
        .count();
    if skipped > 0 {
        log::info!(
            "Workload {workload} rated {tier} with {skipped} requirement(s) skipped for missing metrics"
        );
    } else {
        log::info!("Workload {workload} rated {tier}");
    }

    Ok(Verdict {
        tier,
        recommendation,
        breakdown,
        table_version: table.version().to_string(),
        table_digest: table.digest().to_string(),
    })
}

fn check_tier(spec: &TierSpec, metrics: &NormalizedMetrics) -> Vec<MetricCheck> {
    spec.requirements
        .iter()
        .map(|req| {
            let observed = metrics.get(req.metric);
            let outcome = match observed {
                None => CheckOutcome::Skipped,
                Some(value) if req.op.holds(value, req.bound) => CheckOutcome::Passed,
                Some(_) => CheckOutcome::Failed,
            };

            MetricCheck {
                tier: spec.tier,
                metric: req.metric,
                comparator: req.op,
                bound: req.bound,
                observed,
                outcome,
            }
        })
        .collect()
}
