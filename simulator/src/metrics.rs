//! Simulation metrics.

use std::collections::VecDeque;

/// Outcomes of settlement decisions made during a run.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total decisions attempted.
    pub total_decisions: u64,
    /// Decisions that committed.
    pub successful_decisions: u64,
    /// Decisions that lost the race to another caller.
    pub lost_races: u64,
    /// Approvals refused for lack of funds.
    pub insufficient: u64,
    /// Any other failure.
    pub failed_decisions: u64,
    /// Latency samples (µs).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self {
            total_decisions: 0,
            successful_decisions: 0,
            lost_races: 0,
            insufficient: 0,
            failed_decisions: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a committed decision.
    pub fn record_success(&mut self, latency_us: u64) {
        self.total_decisions += 1;
        self.successful_decisions += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a refused decision by its error code.
    pub fn record_failure(&mut self, error_code: &str) {
        self.total_decisions += 1;
        match error_code {
            "INVALID_STATE" => self.lost_races += 1,
            "INSUFFICIENT_BALANCE" => self.insufficient += 1,
            _ => self.failed_decisions += 1,
        }
    }

    /// Get average latency in µs.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get throughput (decisions per second).
    pub fn throughput(&self, elapsed: std::time::Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }

        self.total_decisions as f64 / secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
