//! Per-test run metrics derived from scheduler lifecycle events.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

/// Lifecycle hook invoked by the scheduler around every run.
pub trait RunObserver: Send + Sync {
    fn on_started(&self, test: &str);
    fn on_finished(&self, test: &str, pass: bool, elapsed: Duration);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn on_started(&self, _test: &str) {}
    fn on_finished(&self, _test: &str, _pass: bool, _elapsed: Duration) {}
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DurationSummary {
    pub count: u64,
    pub sum_seconds: f64,
    pub max_seconds: f64,
}

impl DurationSummary {
    fn observe(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.count += 1;
        self.sum_seconds += secs;
        self.max_seconds = self.max_seconds.max(secs);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TestMetrics {
    pub started: u64,
    pub passed: u64,
    pub failed: u64,
    pub running: u64,
    pub pass_duration: DurationSummary,
    pub fail_duration: DurationSummary,
}

/// In-process metrics registry keyed by test name.
#[derive(Debug, Default)]
pub struct Metrics {
    tests: RwLock<BTreeMap<String, TestMetrics>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every test's figures.
    pub fn snapshot(&self) -> BTreeMap<String, TestMetrics> {
        match self.tests.read() {
            Ok(tests) => tests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, test: &str, f: impl FnOnce(&mut TestMetrics)) {
        let mut tests = match self.tests.write() {
            Ok(tests) => tests,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(tests.entry(test.to_string()).or_default());
    }
}

impl RunObserver for Metrics {
    fn on_started(&self, test: &str) {
        self.update(test, |m| {
            m.started += 1;
            m.running += 1;
        });
    }

    fn on_finished(&self, test: &str, pass: bool, elapsed: Duration) {
        self.update(test, |m| {
            m.running = m.running.saturating_sub(1);
            if pass {
                m.passed += 1;
                m.pass_duration.observe(elapsed);
            } else {
                m.failed += 1;
                m.fail_duration.observe(elapsed);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counts() {
        let metrics = Metrics::new();
        metrics.on_started("ping");
        metrics.on_started("ping");
        assert_eq!(metrics.snapshot()["ping"].running, 2);

        metrics.on_finished("ping", true, Duration::from_millis(500));
        metrics.on_finished("ping", false, Duration::from_secs(2));

        let ping = &metrics.snapshot()["ping"];
        assert_eq!(ping.started, 2);
        assert_eq!(ping.running, 0);
        assert_eq!((ping.passed, ping.failed), (1, 1));
        assert_eq!(ping.pass_duration.count, 1);
        assert!((ping.pass_duration.sum_seconds - 0.5).abs() < 1e-9);
        assert!((ping.fail_duration.max_seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_tests_are_tracked_separately() {
        let metrics = Metrics::new();
        metrics.on_started("a");
        metrics.on_started("b");
        metrics.on_finished("b", true, Duration::ZERO);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["a"].running, 1);
        assert_eq!(snapshot["b"].running, 0);
        assert_eq!(snapshot.len(), 2);
    }
}
