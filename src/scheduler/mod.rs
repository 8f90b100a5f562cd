//! Per-test scheduling loops.
//!
//! Every [`TestDefinition`] gets one loop: launch a run, sleep for the
//! test's frequency, repeat. Runs are spawned, so a slow run never delays
//! the next one's start. All loops hang off one root cancellation token;
//! [`Scheduler::shutdown`] cancels it, which stops the loops and interrupts
//! whatever runs are still in flight.

pub mod engine;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::canary::TestDefinition;
use crate::metrics::{NoopObserver, RunObserver};
use crate::script::ScriptHost;
use crate::storage::CanaryStore;

/// Outcome of a single run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: String,
    pub test: String,
    pub pass: bool,
    pub fail_cause: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(with = "seconds")]
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct Scheduler {
    host: Arc<ScriptHost>,
    store: Arc<dyn CanaryStore>,
    http: reqwest::Client,
    observer: Arc<dyn RunObserver>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(host: Arc<ScriptHost>, store: Arc<dyn CanaryStore>, http: reqwest::Client) -> Self {
        Self {
            host,
            store,
            http,
            observer: Arc::new(NoopObserver),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Start one loop per test. Must be called from within a Tokio runtime.
    pub fn launch(&self, tests: Vec<TestDefinition>) {
        info!(tests = tests.len(), "launching test loops");
        for test in tests {
            let scheduler = self.clone();
            self.tracker.spawn(scheduler.run_forever(Arc::new(test)));
        }
    }

    /// Stop every loop, interrupt in-flight runs and wait for them to be
    /// recorded.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("scheduler stopped");
    }
}

mod seconds {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
