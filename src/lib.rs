//! Canary -- a synthetic-monitoring daemon.
//!
//! User-authored Lua check scripts run on independent schedules, each run in
//! its own sandboxed context with a per-run timeout. Outcomes go to an
//! outcome store that a small HTTP API exposes read-only.

pub mod api;
pub mod bridge;
pub mod canary;
pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod script;
pub mod storage;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use crate::canary::{CanaryConfig, ConfigInterpreter, TestDefinition, TestSummary};
use crate::config::DaemonConfig;
use crate::metrics::Metrics;
use crate::script::{HostValue, ScriptHost};
use crate::storage::{CanaryStore, SqliteStore};

/// A loaded configuration: the base host every run derives from, plus what
/// the configuration script declared.
pub struct LoadedCanary {
    pub host: Arc<ScriptHost>,
    pub config: CanaryConfig,
    pub tests: Vec<TestDefinition>,
}

/// Interpret the configuration script at `root/script` and prepare the base
/// host, which exposes `canary.name` to every run.
pub async fn load_canary(root: &Path, script: &Path) -> Result<LoadedCanary> {
    let interpreter = ConfigInterpreter::new(root, Handle::current());
    let script = script.to_path_buf();
    let (config, tests) = tokio::task::spawn_blocking(move || {
        interpreter.load(&ScriptHost::new(), &script)
    })
    .await
    .context("config loader panicked")??;

    let mut host = ScriptHost::new();
    host.bind("canary", HostValue::map([("name", HostValue::from(config.name.as_str()))]));

    Ok(LoadedCanary {
        host: Arc::new(host),
        config,
        tests,
    })
}

/// Start the canary daemon: outcome store, test loops and query API. Runs
/// until Ctrl-C.
pub async fn serve(cfg: DaemonConfig) -> Result<()> {
    // 1. Move into the working directory
    if cfg.paths.work_dir != Path::new(".") {
        std::env::set_current_dir(&cfg.paths.work_dir)
            .with_context(|| format!("can't change dir to {}", cfg.paths.work_dir.display()))?;
    }

    // 2. Initialize Storage
    let db_path = cfg.paths.database.display().to_string();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path).context("can't open database")?;
    let store: Arc<dyn CanaryStore> = Arc::new(SqliteStore::new(pool));

    // 3. Load the configuration script
    let loaded = load_canary(Path::new("."), &cfg.paths.script)
        .await
        .context("can't load configuration script")?;

    // 4. Bind the listener
    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("can't listen on {addr}"))?;

    // 5. Launch the test loops
    let metrics = Arc::new(Metrics::new());
    let scheduler = scheduler::Scheduler::new(loaded.host.clone(), store.clone(), cfg.http.build_client()?)
        .with_observer(metrics.clone());
    let summaries = loaded.tests.iter().map(TestSummary::from).collect();
    scheduler.launch(loaded.tests);

    // 6. Start API Server
    let app = api::router(api::state::AppState {
        canary: Arc::new(loaded.config),
        tests: Arc::new(summaries),
        store: store.clone(),
        metrics,
    });

    tracing::info!(%addr, "canary listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        })
        .await?;

    // 7. Stop the loops, then release the database
    scheduler.shutdown().await;
    store.close()?;
    Ok(())
}
