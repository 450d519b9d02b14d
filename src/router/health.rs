//! Backend health tracking.
//!
//! In-memory sliding-window metrics per backend. A backend whose failures
//! within the error window reach the threshold is tripped and excluded from
//! routing regardless of its registry flag, until those failures age out.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::BackendId;

// =============================================================================
// Configuration
// =============================================================================

/// Health assessment thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Minimum success rate for HEALTHY status.
    pub success_rate_healthy: f64,
    /// Minimum success rate for DEGRADED status.
    pub success_rate_degraded: f64,
    /// Minimum calls before a status other than UNKNOWN is reported.
    pub min_calls_for_assessment: usize,
    /// Failures within `error_window` that trip a backend.
    pub error_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub error_window: Duration,
    /// Calls remembered per backend.
    pub window_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_rate_healthy: 0.95,
            success_rate_degraded: 0.80,
            min_calls_for_assessment: 5,
            error_threshold: 5,
            error_window: Duration::from_secs(300),
            window_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone)]
struct CallRecord {
    success: bool,
    latency_ms: u64,
    at: Instant,
    error_kind: Option<&'static str>,
}

#[derive(Debug)]
struct BackendWindow {
    records: VecDeque<CallRecord>,
    window_size: usize,
}

impl BackendWindow {
    fn new(window_size: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn push(&mut self, record: CallRecord) {
        if self.records.len() >= self.window_size.max(1) {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    fn success_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().filter(|r| r.success).count() as f64 / self.records.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(|r| r.latency_ms).sum::<u64>() as f64 / self.records.len() as f64
    }

    fn recent_failures(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|r| !r.success && now.duration_since(r.at) <= window)
            .count()
    }

    fn error_patterns(&self) -> Vec<(&'static str, usize)> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for kind in self.records.iter().filter_map(|r| r.error_kind) {
            *counts.entry(kind).or_default() += 1;
        }
        let mut patterns: Vec<_> = counts.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        patterns
    }
}

/// Health of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthReport {
    pub backend: BackendId,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_calls: usize,
    pub recent_failures: usize,
    pub tripped: bool,
    pub error_patterns: Vec<(&'static str, usize)>,
}

/// Sliding-window health tracker keyed by backend.
#[derive(Debug, Default)]
pub struct HealthTracker {
    config: HealthConfig,
    windows: HashMap<BackendId, BackendWindow>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    pub fn record(
        &mut self,
        backend: &BackendId,
        success: bool,
        latency_ms: u64,
        error_kind: Option<&'static str>,
    ) {
        let window_size = self.config.window_size;
        self.windows
            .entry(backend.clone())
            .or_insert_with(|| BackendWindow::new(window_size))
            .push(CallRecord {
                success,
                latency_ms,
                at: Instant::now(),
                error_kind,
            });
    }

    /// Whether recent failures have tripped this backend.
    pub fn is_tripped(&self, backend: &BackendId) -> bool {
        self.windows.get(backend).is_some_and(|w| {
            w.recent_failures(self.config.error_window) >= self.config.error_threshold
        })
    }

    pub fn report(&self, backend: &BackendId) -> BackendHealthReport {
        let Some(w) = self.windows.get(backend) else {
            return BackendHealthReport {
                backend: backend.clone(),
                status: HealthStatus::Unknown,
                success_rate: 0.0,
                avg_latency_ms: 0.0,
                total_calls: 0,
                recent_failures: 0,
                tripped: false,
                error_patterns: Vec::new(),
            };
        };

        let total_calls = w.records.len();
        let success_rate = w.success_rate();
        let recent_failures = w.recent_failures(self.config.error_window);
        let tripped = recent_failures >= self.config.error_threshold;
        let status = if tripped {
            HealthStatus::Unhealthy
        } else if total_calls < self.config.min_calls_for_assessment {
            HealthStatus::Unknown
        } else if success_rate >= self.config.success_rate_healthy {
            HealthStatus::Healthy
        } else if success_rate >= self.config.success_rate_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        BackendHealthReport {
            backend: backend.clone(),
            status,
            success_rate,
            avg_latency_ms: w.avg_latency_ms(),
            total_calls,
            recent_failures,
            tripped,
            error_patterns: w.error_patterns(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: usize) -> HealthTracker {
        HealthTracker::new(HealthConfig {
            error_threshold: threshold,
            error_window: Duration::from_secs(60),
            min_calls_for_assessment: 2,
            ..HealthConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_and_recovers_as_failures_age_out() {
        let mut t = tracker(2);
        let b = BackendId::must("flaky");
        t.record(&b, false, 10, Some("unavailable"));
        assert!(!t.is_tripped(&b));
        t.record(&b, false, 10, Some("unavailable"));
        assert!(t.is_tripped(&b));
        assert_eq!(t.report(&b).status, HealthStatus::Unhealthy);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!t.is_tripped(&b));
    }

    #[test]
    fn test_report_status_bands() {
        let mut t = tracker(100);
        let b = BackendId::must("ok");
        assert_eq!(t.report(&b).status, HealthStatus::Unknown);

        for _ in 0..9 {
            t.record(&b, true, 100, None);
        }
        t.record(&b, false, 300, Some("failed"));
        let report = t.report(&b);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.total_calls, 10);
        assert_eq!(report.avg_latency_ms, 120.0);
        assert_eq!(report.error_patterns, vec![("failed", 1)]);
    }
}
