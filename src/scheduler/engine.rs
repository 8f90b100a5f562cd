//! The run loop and a single run.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::runtime::Handle;
use tracing::{error, info, info_span, Instrument, Span};
use uuid::Uuid;

use super::{RunReport, Scheduler};
use crate::bridge::{self, Capabilities, ScriptLogger};
use crate::canary::TestDefinition;
use crate::script::duration::format_duration;
use crate::script::ScriptError;

impl Scheduler {
    /// Launch a run every `frequency` until shutdown.
    pub(super) async fn run_forever(self, test: Arc<TestDefinition>) {
        info!(
            test.name = %test.name,
            frequency = %format_duration(test.frequency),
            timeout = %format_duration(test.timeout),
            "test loop started"
        );

        loop {
            let scheduler = self.clone();
            let run_test = test.clone();
            self.tracker.spawn(async move {
                scheduler.run_once(&run_test).await;
            });

            // Run again after the configured frequency.
            tokio::select! {
                _ = tokio::time::sleep(test.frequency) => {}
                _ = self.root.cancelled() => break,
            }
        }

        info!(test.name = %test.name, "test loop stopped");
    }

    /// Execute one iteration: start, run under the timeout, classify, end.
    ///
    /// Store failures are logged and never abort the run.
    pub async fn run_once(&self, test: &TestDefinition) -> RunReport {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("test_run", test.name = %test.name, test.id = %id);

        async {
            let started_at = Utc::now();
            let clock = Instant::now();

            if let Err(e) = self.store.start_test(&id, &test.name, started_at) {
                error!(error = %e, "could not start the test");
            }
            self.observer.on_started(&test.name);

            let outcome = self.execute(test, Span::current()).await;
            let elapsed = clock.elapsed();
            let ended_at = Utc::now();

            let pass = outcome.is_ok();
            self.observer.on_finished(&test.name, pass, elapsed);
            match &outcome {
                Ok(()) => info!(elapsed_ms = elapsed.as_millis() as u64, "test passed"),
                Err(cause) => error!(error = %cause, elapsed_ms = elapsed.as_millis() as u64, "test failed"),
            }

            let failure = outcome.as_ref().err().map(String::as_str);
            if let Err(e) = self.store.end_test(&id, failure, ended_at) {
                error!(error = %e, "couldn't mark test as being ended");
            }

            RunReport {
                id: id.clone(),
                test: test.name.clone(),
                pass,
                fail_cause: outcome.err().unwrap_or_default(),
                started_at,
                ended_at,
                elapsed,
            }
        }
        .instrument(span)
        .await
    }

    /// Run the test body in a fresh context on the blocking pool, interrupting
    /// it on timeout or shutdown. The error is the run's failure cause.
    async fn execute(&self, test: &TestDefinition, span: Span) -> Result<(), String> {
        let caps = Capabilities {
            http: self.http.clone(),
            logger: ScriptLogger::new(span),
            runtime: Handle::current(),
        };
        let ctx = self.host.derive().map_err(|e| e.to_string())?;
        bridge::install(&ctx, &caps).map_err(|e| e.to_string())?;

        let interrupter = ctx.interrupter();
        let scope = self.root.child_token();
        let body = test.body.clone();
        let mut run = tokio::task::spawn_blocking(move || ctx.execute(&body));

        let result = tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(test.timeout) => {
                interrupter.interrupt(format!("timed out after {}", format_duration(test.timeout)));
                run.await
            }
            _ = scope.cancelled() => {
                interrupter.interrupt("run cancelled");
                run.await
            }
        };

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(ScriptError::Interrupted(reason))) => Err(reason),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("run aborted: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::metrics::{Metrics, RunObserver};
    use crate::script::{CompiledScript, HostValue, ScriptHost};
    use crate::storage::{open_memory_pool, CanaryStore, SqliteStore, StoreError, TestRun};

    /// Store wrapper that records the order of lifecycle calls.
    struct RecordingStore {
        inner: SqliteStore,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::new(open_memory_pool().unwrap()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CanaryStore for RecordingStore {
        fn start_test(&self, id: &str, name: &str, start_at: DateTime<Utc>) -> Result<TestRun, StoreError> {
            self.calls.lock().unwrap().push(format!("start {name}"));
            self.inner.start_test(id, name, start_at)
        }
        fn end_test(&self, id: &str, failure: Option<&str>, end_at: DateTime<Utc>) -> Result<TestRun, StoreError> {
            self.calls.lock().unwrap().push(format!("end pass={}", failure.is_none()));
            self.inner.end_test(id, failure, end_at)
        }
        fn list_tests(&self) -> Result<Vec<TestRun>, StoreError> {
            self.inner.list_tests()
        }
        fn list_ongoing_tests(&self) -> Result<Vec<TestRun>, StoreError> {
            self.inner.list_ongoing_tests()
        }
        fn find_test_by_id(&self, id: &str) -> Result<Option<TestRun>, StoreError> {
            self.inner.find_test_by_id(id)
        }
        fn load_test(&self, id: &str) -> Result<Option<TestRun>, StoreError> {
            self.inner.load_test(id)
        }
        fn close(&self) -> Result<(), StoreError> {
            self.inner.close()
        }
    }

    fn definition(name: &str, frequency: &str, timeout: &str, source: &str) -> TestDefinition {
        use crate::script::duration::parse_duration;
        TestDefinition {
            name: name.to_string(),
            frequency: parse_duration(frequency).unwrap(),
            timeout: parse_duration(timeout).unwrap(),
            body: CompiledScript::compile(name, source).unwrap(),
        }
    }

    fn scheduler(host: ScriptHost, store: Arc<dyn CanaryStore>) -> Scheduler {
        Scheduler::new(Arc::new(host), store, reqwest::Client::new())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_passes_and_is_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut host = ScriptHost::new();
        host.bind("target", HostValue::from(format!("{}/", server.uri())));
        let store = Arc::new(RecordingStore::new());
        let scheduler = scheduler(host, store.clone());

        let test = definition(
            "ping",
            "10s",
            "2s",
            "local res = http['do']('GET', target, {}, '') if res.code ~= 200 then log.fail('bad code') end",
        );
        let report = scheduler.run_once(&test).await;

        assert!(report.pass, "{}", report.fail_cause);
        assert_eq!(report.fail_cause, "");
        assert_eq!(store.calls(), ["start ping", "end pass=true"]);

        let persisted = store.list_tests().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, report.id);
        assert!(persisted[0].pass);
        assert!(store.list_ongoing_tests().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_waits_for_frequency_between_runs() {
        let store = Arc::new(RecordingStore::new());
        let scheduler = scheduler(ScriptHost::new(), store.clone());
        scheduler.launch(vec![definition("tick", "10s", "1s", "return true")]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown().await;

        assert_eq!(store.calls(), ["start tick", "end pass=true"]);
        assert_eq!(store.list_tests().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_log_fail_fails_the_run() {
        let store = Arc::new(RecordingStore::new());
        let scheduler = scheduler(ScriptHost::new(), store.clone());
        let test = definition("boom", "1s", "1s", "log.fail('nope')");

        for _ in 0..2 {
            let report = scheduler.run_once(&test).await;
            assert!(!report.pass);
            assert!(report.fail_cause.contains("nope"), "{}", report.fail_cause);
        }

        let runs = store.list_tests().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| !r.pass && r.fail_cause.contains("nope")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_interrupts_sleep_and_busy_loops() {
        let store = Arc::new(RecordingStore::new());
        let scheduler = scheduler(ScriptHost::new(), store.clone());

        for source in ["time.sleep('30s')", "while true do end"] {
            let test = definition("slow", "1m", "100ms", source);
            let report = scheduler.run_once(&test).await;
            assert!(!report.pass);
            assert_eq!(report.fail_cause, "timed out after 100ms");
            assert!(report.elapsed < Duration::from_secs(5), "{:?}", report.elapsed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_in_flight_runs() {
        let store = Arc::new(RecordingStore::new());
        let metrics = Arc::new(Metrics::new());
        let scheduler = scheduler(ScriptHost::new(), store.clone())
            .with_observer(metrics.clone() as Arc<dyn RunObserver>);
        scheduler.launch(vec![definition("sleepy", "1h", "1h", "time.sleep('1h')")]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.list_ongoing_tests().unwrap().len(), 1);
        assert_eq!(metrics.snapshot()["sleepy"].running, 1);

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .unwrap();

        let runs = store.list_tests().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].fail_cause, "run cancelled");
        assert!(store.list_ongoing_tests().unwrap().is_empty());
        assert_eq!(metrics.snapshot()["sleepy"].failed, 1);
        assert!(scheduler.root.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_failures_do_not_stop_the_run() {
        let store = Arc::new(RecordingStore::new());
        store.close().unwrap();
        let scheduler = scheduler(ScriptHost::new(), store.clone());

        let report = scheduler.run_once(&definition("offline", "1s", "1s", "return 1")).await;
        assert!(report.pass);
        assert_eq!(store.calls(), ["start offline", "end pass=true"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_are_isolated() {
        let scheduler = scheduler(ScriptHost::new(), Arc::new(RecordingStore::new()));
        let test = definition(
            "isolated",
            "1s",
            "1s",
            "if leaked ~= nil then log.fail('saw previous run') end leaked = true",
        );
        assert!(scheduler.run_once(&test).await.pass);
        assert!(scheduler.run_once(&test).await.pass);
    }
}
