use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use canary::config::{DaemonConfig, LogFormat};
use canary::script::duration::format_duration;
use canary::storage::{open_memory_pool, SqliteStore};

#[derive(Parser)]
#[command(
    name = "canary",
    about = "Synthetic-monitoring daemon running scripted checks on independent schedules",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (test loops + query API)
    Serve {
        /// Daemon config file (TOML); defaults to $CANARY_CONFIG
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the Lua configuration script
        #[arg(long)]
        cfg: Option<PathBuf>,

        /// Directory to run from; relative paths in the script resolve here
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// File for the canary database
        #[arg(long)]
        db_file: Option<PathBuf>,

        /// Interface on which to listen
        #[arg(long)]
        listen_host: Option<String>,

        /// Port on which to listen
        #[arg(long)]
        listen_port: Option<u16>,

        /// Log output format
        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,
    },

    /// Load a configuration script and optionally run every test once
    Check {
        /// Path to the Lua configuration script
        #[arg(long, default_value = canary::canary::DEFAULT_SCRIPT)]
        cfg: PathBuf,

        /// Directory the script's relative paths resolve against
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Run each test once and report pass/fail
        #[arg(long)]
        run: bool,

        /// Exit non-zero on the first failing test (implies --run)
        #[arg(long)]
        fail_on_error: bool,
    },
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            cfg,
            work_dir,
            db_file,
            listen_host,
            listen_port,
            log_format,
        } => {
            let mut daemon = DaemonConfig::load_or_default(config.as_deref())?;
            if let Some(cfg) = cfg {
                daemon.paths.script = cfg;
            }
            if let Some(work_dir) = work_dir {
                daemon.paths.work_dir = work_dir;
            }
            if let Some(db_file) = db_file {
                daemon.paths.database = db_file;
            }
            if let Some(host) = listen_host {
                daemon.listen.host = host;
            }
            if let Some(port) = listen_port {
                daemon.listen.port = port;
            }
            if let Some(format) = log_format {
                daemon.logging.format = format;
            }

            init_tracing(&daemon.logging.level, daemon.logging.format);
            tracing::info!(addr = %daemon.listen_addr(), "Starting canary daemon");
            canary::serve(daemon).await?;
        }
        Commands::Check {
            cfg,
            work_dir,
            run,
            fail_on_error,
        } => {
            init_tracing("warn", LogFormat::Pretty);
            let loaded = canary::load_canary(&work_dir, &cfg).await?;

            println!("Canary: {}", loaded.config.name);
            println!("{:<30} | {:<10} | Timeout", "Test", "Frequency");
            println!("{:-<30}-|-{:-<10}-|-{:-<10}", "", "", "");
            for test in &loaded.tests {
                println!(
                    "{:<30} | {:<10} | {}",
                    test.name,
                    format_duration(test.frequency),
                    format_duration(test.timeout)
                );
            }

            if run || fail_on_error {
                let store = Arc::new(SqliteStore::new(open_memory_pool()?));
                let scheduler = canary::scheduler::Scheduler::new(
                    loaded.host.clone(),
                    store,
                    DaemonConfig::default().http.build_client()?,
                );

                println!();
                let mut failed = 0;
                for test in &loaded.tests {
                    let report = scheduler.run_once(test).await;
                    if report.pass {
                        println!("PASS {} ({:.2}s)", report.test, report.elapsed.as_secs_f64());
                    } else {
                        failed += 1;
                        println!("FAIL {}: {}", report.test, report.fail_cause);
                        if fail_on_error {
                            bail!("test {:?} failed: {}", report.test, report.fail_cause);
                        }
                    }
                }
                println!("\n{} passed, {} failed", loaded.tests.len() - failed, failed);
            }
        }
    }

    Ok(())
}
