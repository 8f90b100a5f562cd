//! Loads the bundled demo configuration and drives its tests through the
//! scheduler against a mock HTTP target.

use std::path::Path;
use std::sync::Arc;

use canary::metrics::Metrics;
use canary::scheduler::Scheduler;
use canary::storage::{open_pool, CanaryStore, SqliteStore};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_demo_config_runs_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;
    std::env::set_var("CANARY_TARGET", server.uri());

    let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    let loaded = canary::load_canary(&demos, Path::new("config.lua"))
        .await
        .unwrap();
    assert_eq!(loaded.config.name, "Example Canary");
    let names: Vec<_> = loaded.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["simple example test", "http demonstration"]);

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("canary.db");
    let store = Arc::new(SqliteStore::new(open_pool(db.to_str().unwrap()).unwrap()));
    let metrics = Arc::new(Metrics::new());
    let scheduler = Scheduler::new(loaded.host.clone(), store.clone(), reqwest::Client::new())
        .with_observer(metrics.clone());

    for test in &loaded.tests {
        let report = scheduler.run_once(test).await;
        assert!(report.pass, "{}: {}", report.test, report.fail_cause);
    }

    let runs = store.list_tests().unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.pass && r.end_at.is_some()));
    assert!(store.list_ongoing_tests().unwrap().is_empty());
    assert_eq!(metrics.snapshot()["http demonstration"].passed, 1);
    store.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.lua"),
        r#"register_test({ name = "x", frequency = "1s", timeout = "1s" }, "local = ")"#,
    )
    .unwrap();

    let err = canary::load_canary(dir.path(), Path::new("config.lua"))
        .await
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("can't apply configuration"), "{err:#}");
}
