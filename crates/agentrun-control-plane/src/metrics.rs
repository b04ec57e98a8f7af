//! Metrics collection and Prometheus formatting.
//!
//! [`MetricsCollector`] keeps lock-free task counters plus a bounded window of recent execution
//! durations behind its own lock. [`MetricsData`] is the periodic snapshot the orchestrator
//! publishes, and [`render_prometheus`] formats it in the text exposition format.

use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Task counters and a sliding window of durations.
#[derive(Debug)]
pub struct MetricsCollector {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    window: usize,
    durations: RwLock<VecDeque<Duration>>,
}

impl MetricsCollector {
    /// Keep the most recent `window` durations (minimum 1).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            window,
            durations: RwLock::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an execution duration, evicting the oldest once the window is full.
    pub fn record_duration(&self, duration: Duration) {
        let mut durations = self.durations.write().unwrap_or_else(|e| e.into_inner());
        if durations.len() == self.window {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Number of durations currently in the window.
    pub fn samples(&self) -> usize {
        self.durations.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Mean of the recorded durations, zero when none are recorded.
    pub fn average_duration(&self) -> Duration {
        let durations = self.durations.read().unwrap_or_else(|e| e.into_inner());
        if durations.is_empty() {
            return Duration::ZERO;
        }
        let total = durations
            .iter()
            .fold(Duration::ZERO, |sum, d| sum.saturating_add(*d));
        total / u32::try_from(durations.len()).unwrap_or(u32::MAX)
    }

    /// Completed over finished (completed + failed), in `[0, 1]`. Zero before anything finishes.
    pub fn success_rate(&self) -> f64 {
        let completed = self.completed() as f64;
        let finished = completed + self.failed() as f64;
        if finished == 0.0 {
            0.0
        } else {
            completed / finished
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Point-in-time orchestrator metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsData {
    /// Configured pool ceiling.
    pub max_agents: usize,
    /// Registered agents.
    pub agents: usize,
    /// Agents with at least one task in flight.
    pub busy_agents: usize,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Tasks waiting in the submission queue.
    pub queued_tasks: usize,
    pub average_task_time_ms: f64,
    pub success_rate: f64,
    /// In-flight workload over total workload capacity of the pool.
    pub system_load: f64,
    pub collected_at: DateTime<Utc>,
}

/// Format a snapshot as Prometheus text.
pub fn render_prometheus(data: &MetricsData) -> String {
    let mut output = String::new();

    writeln!(output, "# HELP agentrun_agents Number of agents in the pool").ok();
    writeln!(output, "# TYPE agentrun_agents gauge").ok();
    writeln!(output, "agentrun_agents{{state=\"registered\"}} {}", data.agents).ok();
    writeln!(output, "agentrun_agents{{state=\"busy\"}} {}", data.busy_agents).ok();
    writeln!(output, "agentrun_agents{{state=\"max\"}} {}", data.max_agents).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP agentrun_tasks_total Tasks accepted and finished since start"
    )
    .ok();
    writeln!(output, "# TYPE agentrun_tasks_total counter").ok();
    writeln!(output, "agentrun_tasks_total{{outcome=\"submitted\"}} {}", data.total_tasks).ok();
    writeln!(
        output,
        "agentrun_tasks_total{{outcome=\"completed\"}} {}",
        data.completed_tasks
    )
    .ok();
    writeln!(output, "agentrun_tasks_total{{outcome=\"failed\"}} {}", data.failed_tasks).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP agentrun_tasks_queued Tasks waiting for dispatch").ok();
    writeln!(output, "# TYPE agentrun_tasks_queued gauge").ok();
    writeln!(output, "agentrun_tasks_queued {}", data.queued_tasks).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP agentrun_task_duration_avg_seconds Mean execution time over the recent window"
    )
    .ok();
    writeln!(output, "# TYPE agentrun_task_duration_avg_seconds gauge").ok();
    writeln!(
        output,
        "agentrun_task_duration_avg_seconds {}",
        data.average_task_time_ms / 1000.0
    )
    .ok();

    writeln!(output).ok();
    writeln!(output, "# HELP agentrun_task_success_ratio Completed over finished tasks").ok();
    writeln!(output, "# TYPE agentrun_task_success_ratio gauge").ok();
    writeln!(output, "agentrun_task_success_ratio {}", data.success_rate).ok();

    writeln!(output).ok();
    writeln!(output, "# HELP agentrun_system_load Pool workload over pool capacity").ok();
    writeln!(output, "# TYPE agentrun_system_load gauge").ok();
    writeln!(output, "agentrun_system_load {}", data.system_load).ok();

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_success_rate() {
        let metrics = MetricsCollector::default();
        assert_eq!(metrics.success_rate(), 0.0);

        for _ in 0..4 {
            metrics.increment_total();
        }
        metrics.increment_completed();
        metrics.increment_completed();
        metrics.increment_completed();
        metrics.increment_failed();

        assert_eq!(metrics.total(), 4);
        assert!((metrics.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_saturates_instead_of_overflowing() {
        let metrics = MetricsCollector::new(2);
        metrics.record_duration(Duration::MAX);
        metrics.record_duration(Duration::MAX);
        assert_eq!(metrics.average_duration(), Duration::MAX / 2);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let metrics = MetricsCollector::new(3);
        for ms in [1000, 10, 20, 30] {
            metrics.record_duration(Duration::from_millis(ms));
        }
        assert_eq!(metrics.samples(), 3);
        assert_eq!(metrics.average_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_average_of_empty_window() {
        assert_eq!(MetricsCollector::new(0).average_duration(), Duration::ZERO);
    }

    #[test]
    fn test_render_prometheus() {
        let data = MetricsData {
            max_agents: 10,
            agents: 2,
            busy_agents: 1,
            total_tasks: 5,
            completed_tasks: 3,
            failed_tasks: 1,
            queued_tasks: 1,
            average_task_time_ms: 1500.0,
            success_rate: 0.75,
            system_load: 0.1,
            collected_at: Utc::now(),
        };
        let output = render_prometheus(&data);

        assert!(output.contains("agentrun_agents{state=\"registered\"} 2"));
        assert!(output.contains("agentrun_tasks_total{outcome=\"completed\"} 3"));
        assert!(output.contains("agentrun_tasks_queued 1"));
        assert!(output.contains("agentrun_task_duration_avg_seconds 1.5"));
        assert!(output.contains("agentrun_task_success_ratio 0.75"));
    }
}
