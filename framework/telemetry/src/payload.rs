//! The subset of the fio JSON output (`--output-format=json`) that the parser reads.
//!
//! Every field is optional because different fio releases emit different fields. Unknown fields
//! are ignored.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct Payload {
    #[serde(rename = "fio version")]
    pub fio_version: Option<String>,
    pub jobs: Option<Vec<Job>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Job {
    pub jobname: Option<String>,
    #[serde(default)]
    pub error: i64,
    pub read: Option<Section>,
    pub write: Option<Section>,
}

/// Per-direction statistics of one sub-job. Bandwidth fields are in KiB/s.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Section {
    pub io_bytes: Option<u64>,
    pub total_ios: Option<u64>,
    pub bw: Option<f64>,
    pub bw_bytes: Option<f64>,
    pub bw_min: Option<f64>,
    pub bw_mean: Option<f64>,
    pub iops: Option<f64>,
    pub iops_mean: Option<f64>,
    pub lat_ns: Option<LatencyStats>,
    pub lat_us: Option<LatencyStats>,
    /// fio 2.x total latency, reported in microseconds.
    pub lat: Option<LatencyStats>,
    pub clat_ns: Option<LatencyStats>,
    pub clat_us: Option<LatencyStats>,
    pub clat: Option<LatencyStats>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LatencyStats {
    pub mean: Option<f64>,
    #[serde(rename = "N")]
    pub samples: Option<u64>,
}

impl Section {
    /// Whether the sub-job performed any I/O in this direction.
    pub fn is_active(&self) -> bool {
        self.io_bytes.is_some_and(|v| v > 0)
            || self.total_ios.is_some_and(|v| v > 0)
            || self.bw.is_some_and(|v| v > 0.0)
            || self.bw_bytes.is_some_and(|v| v > 0.0)
            || self.iops.is_some_and(|v| v > 0.0)
    }

    /// Bandwidth in MB/s. `bw` is KiB/s, `bw_bytes` is bytes/s.
    pub fn bandwidth_mbps(&self) -> Option<f64> {
        self.bw
            .map(|kib| kib / 1024.0)
            .or_else(|| self.bw_bytes.map(|bytes| bytes / (1024.0 * 1024.0)))
    }

    /// Operation rate, falling back to the sampled mean when the direct count is missing.
    pub fn iops(&self) -> Option<f64> {
        self.iops.or(self.iops_mean)
    }

    /// Mean latency in milliseconds.
    ///
    /// The unit comes from the key the engine used. Total latency is preferred, completion
    /// latency is the fallback for outputs that omit it.
    pub fn mean_latency_ms(&self) -> Option<f64> {
        const NS_PER_MS: f64 = 1_000_000.0;
        const US_PER_MS: f64 = 1_000.0;

        let candidates = [
            (&self.lat_ns, NS_PER_MS),
            (&self.lat_us, US_PER_MS),
            (&self.lat, US_PER_MS),
            (&self.clat_ns, NS_PER_MS),
            (&self.clat_us, US_PER_MS),
            (&self.clat, US_PER_MS),
        ];

        candidates
            .into_iter()
            .find_map(|(stats, divisor)| stats.as_ref()?.mean_value().map(|v| v / divisor))
    }
}

impl LatencyStats {
    /// The mean, unless the block reports that no samples were taken.
    fn mean_value(&self) -> Option<f64> {
        if self.samples == Some(0) {
            return None;
        }
        self.mean
    }
}
