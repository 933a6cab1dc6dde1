use std::time::Duration;

use disk_tunnel_summary_model::ProgressUpdate;

use crate::plan::PhasePlan;

/// Progress stays below this value until the result payload has been parsed.
const IN_FLIGHT_CAP: f64 = 99.0;

/// Tracks how far a run is through its phase plan.
///
/// Progress is driven by elapsed time weighted by phase and refined by the completion
/// percentage fio prints on its status lines. Reported progress never decreases.
#[derive(Debug)]
pub struct ProgressTracker {
    /// `(duration_secs, weight)` per phase.
    phases: Vec<(u64, f64)>,
    total_weight: f64,
    engine_percent: f64,
    reported_percent: f64,
    reported_phase: usize,
}

impl ProgressTracker {
    pub fn new(plan: &PhasePlan) -> Self {
        let phases = plan
            .phases
            .iter()
            .map(|p| (p.duration_secs, p.effective_weight().max(0.0)))
            .collect::<Vec<_>>();
        let total_weight = phases.iter().map(|(_, w)| w).sum();

        Self {
            phases,
            total_weight,
            engine_percent: 0.0,
            reported_percent: 0.0,
            reported_phase: 0,
        }
    }

    pub fn planned_duration(&self) -> Duration {
        Duration::from_secs(self.phases.iter().map(|(d, _)| d).sum())
    }

    /// Feed one line of engine output. Returns whether it carried a completion percentage.
    pub fn observe_line(&mut self, line: &str) -> bool {
        match parse_engine_percent(line) {
            Some(percent) => {
                self.engine_percent = self.engine_percent.max(percent);
                true
            }
            None => false,
        }
    }

    /// Phase index and percentage by the clock alone.
    fn clock_position(&self, elapsed: Duration) -> (usize, f64) {
        if self.phases.is_empty() {
            return (0, 0.0);
        }

        let elapsed = elapsed.as_secs_f64();
        let mut phase_start = 0.0;
        let mut weight_done = 0.0;

        for (index, (duration, weight)) in self.phases.iter().enumerate() {
            let duration = *duration as f64;
            if elapsed < phase_start + duration {
                let fraction = ((elapsed - phase_start) / duration).clamp(0.0, 1.0);
                return (index, self.percent_of(weight_done + weight * fraction, index));
            }
            phase_start += duration;
            weight_done += weight;
        }

        (self.phases.len() - 1, 100.0)
    }

    fn percent_of(&self, weight: f64, index: usize) -> f64 {
        if self.total_weight > 0.0 {
            weight / self.total_weight * 100.0
        } else {
            // All weights zero, count phases instead
            index as f64 / self.phases.len() as f64 * 100.0
        }
    }

    /// Produce the next progress snapshot.
    pub fn snapshot(&mut self, elapsed: Duration, output_tail: Option<String>) -> ProgressUpdate {
        let (phase_index, clock_percent) = self.clock_position(elapsed);

        let percent = clock_percent.max(self.engine_percent).min(IN_FLIGHT_CAP);
        self.reported_percent = self.reported_percent.max(percent);
        self.reported_phase = self.reported_phase.max(phase_index);

        let eta_seconds = self.planned_duration().saturating_sub(elapsed).as_secs();

        ProgressUpdate {
            phase_index: self.reported_phase,
            percent: self.reported_percent,
            elapsed_seconds: elapsed.as_secs(),
            eta_seconds: Some(eta_seconds),
            output_tail,
        }
    }
}

/// Extract the completion percentage from a fio status line.
///
/// Status lines look like `Jobs: 1 (f=1): [R(1)][45.5%][r=1024MiB/s][eta 00m:11s]`.
pub fn parse_engine_percent(line: &str) -> Option<f64> {
    if !line.trim_start().starts_with("Jobs:") {
        return None;
    }

    line.split('[')
        .filter_map(|segment| segment.split(']').next())
        .filter_map(|segment| segment.strip_suffix('%'))
        .find_map(|number| number.trim().parse::<f64>().ok())
        .filter(|percent| percent.is_finite())
        .map(|percent| percent.clamp(0.0, 100.0))
}
