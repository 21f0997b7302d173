// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process metrics for the task runtime.
//!
//! Counts status transitions and agent invocations and keeps latency
//! histograms for storage, git and test operations. Nothing is exported;
//! a snapshot can be rendered with [`MetricsSnapshot::format_report`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::store::TaskStatus;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Latency bucket upper bounds in milliseconds.
///
/// Storage calls land in the first buckets, agent turns and test runs in
/// the last ones.
const LATENCY_BUCKETS_MS: [u64; 8] = [1, 10, 100, 1_000, 10_000, 60_000, 300_000, 1_800_000];

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    operations: RwLock<HashMap<String, OperationMetrics>>,
    agents: RwLock<HashMap<String, AgentMetrics>>,
    transitions: RwLock<BTreeMap<String, u64>>,
    claims: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            transitions: RwLock::new(BTreeMap::new()),
            claims: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a timed operation such as `store.claim` or `git.apply`.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        if let Ok(mut ops) = self.operations.write() {
            ops.entry(name.to_string()).or_default().record(duration);
        }
    }

    /// Record one agent turn.
    pub fn record_agent(&self, name: &str, duration: Duration, success: bool) {
        if let Ok(mut agents) = self.agents.write() {
            agents.entry(name.to_string()).or_default().record(duration, success);
        }
    }

    /// Count a task entering `status`.
    pub fn record_transition(&self, status: TaskStatus) {
        if let Ok(mut transitions) = self.transitions.write() {
            *transitions.entry(status.as_str().to_string()).or_insert(0) += 1;
        }
    }

    /// Count a successful claim by a worker.
    pub fn record_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations.read().ok()?.get(name).cloned()
    }

    pub fn agent_metrics(&self, name: &str) -> Option<AgentMetrics> {
        self.agents.read().ok()?.get(name).cloned()
    }

    pub fn transition_count(&self, status: TaskStatus) -> u64 {
        self.transitions
            .read()
            .ok()
            .and_then(|t| t.get(status.as_str()).copied())
            .unwrap_or(0)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self.operations.read().map(|o| o.clone()).unwrap_or_default(),
            agents: self.agents.read().map(|a| a.clone()).unwrap_or_default(),
            transitions: self.transitions.read().map(|t| t.clone()).unwrap_or_default(),
            claims: self.claims.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut ops) = self.operations.write() {
            ops.clear();
        }
        if let Ok(mut agents) = self.agents.write() {
            agents.clear();
        }
        if let Ok(mut transitions) = self.transitions.write() {
            transitions.clear();
        }
        self.claims.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-agent call statistics.
#[derive(Debug, Clone, Default)]
pub struct AgentMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub latency: LatencyHistogram,
}

impl AgentMetrics {
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.calls += 1;
        if !success {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.latency.record(duration);
    }

    /// Fraction of calls that succeeded; 1.0 when nothing was recorded.
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 1.0;
        }
        (self.calls - self.failures) as f64 / self.calls as f64
    }
}

/// Timed operation statistics.
#[derive(Debug, Clone, Default)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
    pub latency: LatencyHistogram,
}

impl OperationMetrics {
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.max_duration = self.max_duration.max(duration);
        self.latency.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.total_duration / n,
        }
    }
}

/// Fixed-bucket latency histogram over [`LATENCY_BUCKETS_MS`].
#[derive(Debug, Clone, Default)]
pub struct LatencyHistogram {
    counts: [u64; LATENCY_BUCKETS_MS.len() + 1],
}

impl LatencyHistogram {
    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.counts[idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Upper bound of the bucket containing the `p`th percentile.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }
        let target = ((total as f64) * p / 100.0).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                let bound = LATENCY_BUCKETS_MS
                    .get(idx)
                    .copied()
                    .unwrap_or(LATENCY_BUCKETS_MS[LATENCY_BUCKETS_MS.len() - 1] * 2);
                return Duration::from_millis(bound);
            }
        }
        Duration::ZERO
    }
}

/// A point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub operations: HashMap<String, OperationMetrics>,
    pub agents: HashMap<String, AgentMetrics>,
    pub transitions: BTreeMap<String, u64>,
    pub claims: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Runtime Metrics ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!("Claims: {}\n\n", self.claims));

        if !self.transitions.is_empty() {
            report.push_str("Transitions:\n");
            for (status, count) in &self.transitions {
                report.push_str(&format!("  {}: {}\n", status, count));
            }
            report.push('\n');
        }

        if !self.agents.is_empty() {
            report.push_str("Agents:\n");
            let mut names: Vec<_> = self.agents.keys().collect();
            names.sort();
            for name in names {
                let m = &self.agents[name];
                report.push_str(&format!(
                    "  {}: {} calls, {:.1}% ok, p90 {:.2?}\n",
                    name,
                    m.calls,
                    m.success_rate() * 100.0,
                    m.latency.percentile(90.0)
                ));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            report.push_str("Operations:\n");
            let mut names: Vec<_> = self.operations.keys().collect();
            names.sort();
            for name in names {
                let m = &self.operations[name];
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, max {:.2?}\n",
                    name,
                    m.count,
                    m.avg_duration(),
                    m.max_duration
                ));
            }
        }

        report
    }
}

/// Record an operation to the global metrics.
pub fn record_operation(name: &str, duration: Duration) {
    GLOBAL_METRICS.record_operation(name, duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics() {
        let mut metrics = AgentMetrics::default();
        metrics.record(Duration::from_secs(3), true);
        metrics.record(Duration::from_secs(5), true);
        metrics.record(Duration::from_secs(1), false);

        assert_eq!(metrics.calls, 3);
        assert_eq!(metrics.failures, 1);
        assert!((metrics.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_operation_average() {
        let mut metrics = OperationMetrics::default();
        metrics.record(Duration::from_millis(10));
        metrics.record(Duration::from_millis(30));

        assert_eq!(metrics.count, 2);
        assert_eq!(metrics.avg_duration(), Duration::from_millis(20));
        assert_eq!(metrics.max_duration, Duration::from_millis(30));
    }

    #[test]
    fn test_histogram_buckets() {
        let mut hist = LatencyHistogram::default();
        hist.record(Duration::from_micros(500));
        hist.record(Duration::from_millis(50));
        hist.record(Duration::from_secs(90));
        hist.record(Duration::from_secs(7200));

        assert_eq!(hist.counts()[0], 1);
        assert_eq!(hist.counts()[2], 1);
        assert_eq!(hist.counts()[6], 1);
        assert_eq!(hist.counts()[8], 1);
    }

    #[test]
    fn test_histogram_percentile() {
        let mut hist = LatencyHistogram::default();
        for _ in 0..10 {
            hist.record(Duration::from_millis(5));
        }
        assert_eq!(hist.percentile(50.0), Duration::from_millis(10));
        assert_eq!(LatencyHistogram::default().percentile(99.0), Duration::ZERO);
    }

    #[test]
    fn test_transitions_and_reset() {
        let metrics = Metrics::new();
        metrics.record_transition(TaskStatus::Running);
        metrics.record_transition(TaskStatus::Running);
        metrics.record_transition(TaskStatus::Merged);
        metrics.record_claim();

        assert_eq!(metrics.transition_count(TaskStatus::Running), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claims, 1);
        assert!(snapshot.format_report().contains("RUNNING: 2"));

        metrics.reset();
        assert_eq!(metrics.transition_count(TaskStatus::Running), 0);
    }
}
