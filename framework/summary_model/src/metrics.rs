use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Normalized result of one run, independent of the engine output variant it was parsed from.
///
/// Every field is optional. A metric the engine did not report stays `None`, it is never filled
/// in with a placeholder value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMetrics {
    /// Summed read bandwidth across sub-jobs, in MB/s (1024-based).
    pub read_bandwidth_mbps: Option<f64>,
    /// Summed write bandwidth across sub-jobs, in MB/s (1024-based).
    pub write_bandwidth_mbps: Option<f64>,
    pub read_iops: Option<f64>,
    pub write_iops: Option<f64>,
    pub avg_read_latency_ms: Option<f64>,
    pub avg_write_latency_ms: Option<f64>,
    /// `sum(bw_min) / sum(bw_mean)` across sub-jobs which report both.
    pub stability_ratio: Option<f64>,
}

impl NormalizedMetrics {
    pub fn get(&self, metric: MetricName) -> Option<f64> {
        match metric {
            MetricName::ReadBwMb => self.read_bandwidth_mbps,
            MetricName::WriteBwMb => self.write_bandwidth_mbps,
            MetricName::ReadIops => self.read_iops,
            MetricName::WriteIops => self.write_iops,
            MetricName::AvgReadLatencyMs => self.avg_read_latency_ms,
            MetricName::AvgWriteLatencyMs => self.avg_write_latency_ms,
            MetricName::StabilityRatio => self.stability_ratio,
        }
    }

    /// True when no metric at all could be extracted.
    pub fn is_empty(&self) -> bool {
        MetricName::ALL.iter().all(|metric| self.get(*metric).is_none())
    }
}

/// Names used to refer to a metric from a threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    ReadBwMb,
    WriteBwMb,
    ReadIops,
    WriteIops,
    AvgReadLatencyMs,
    AvgWriteLatencyMs,
    StabilityRatio,
}

impl MetricName {
    pub const ALL: [MetricName; 7] = [
        MetricName::ReadBwMb,
        MetricName::WriteBwMb,
        MetricName::ReadIops,
        MetricName::WriteIops,
        MetricName::AvgReadLatencyMs,
        MetricName::AvgWriteLatencyMs,
        MetricName::StabilityRatio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::ReadBwMb => "read_bw_mb",
            MetricName::WriteBwMb => "write_bw_mb",
            MetricName::ReadIops => "read_iops",
            MetricName::WriteIops => "write_iops",
            MetricName::AvgReadLatencyMs => "avg_read_latency_ms",
            MetricName::AvgWriteLatencyMs => "avg_write_latency_ms",
            MetricName::StabilityRatio => "stability_ratio",
        }
    }
}

impl FromStr for MetricName {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or("Unknown metric name")
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
