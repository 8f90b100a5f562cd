//! TOML configuration for the canary daemon.
//!
//! Every section has compiled-in defaults, so an absent file or a partial
//! one is fine. The file path comes from `--config` or `CANARY_CONFIG`;
//! command-line flags are applied on top afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the daemon config file.
pub const CONFIG_ENV: &str = "CANARY_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded daemon configuration");
        Ok(config)
    }

    /// Load from `explicit` if given (errors are fatal), else from
    /// `CANARY_CONFIG` if set (errors fall back to defaults), else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CANARY_CONFIG set but file could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file given, using compiled-in defaults");
        Ok(Self::default())
    }

    /// `host:port` to bind the query facade to. An empty host listens on
    /// all interfaces.
    pub fn listen_addr(&self) -> String {
        let host = if self.listen.host.is_empty() {
            "0.0.0.0"
        } else {
            self.listen.host.as_str()
        };
        format!("{host}:{}", self.listen.port)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory to run from; relative paths in the config script resolve here.
    pub work_dir: PathBuf,
    /// Configuration script, relative to `work_dir`.
    pub script: PathBuf,
    /// SQLite database file for terminal test runs.
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            script: PathBuf::from(crate::canary::DEFAULT_SCRIPT),
            database: PathBuf::from("canary.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Settings for the client shared by every test script's `http` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("canary/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()
            .context("failed to build HTTP client")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = DaemonConfig::default();

        assert_eq!(cfg.paths.work_dir, PathBuf::from("."));
        assert_eq!(cfg.paths.script, PathBuf::from("config.lua"));
        assert_eq!(cfg.paths.database, PathBuf::from("canary.db"));

        assert_eq!(cfg.listen.host, "");
        assert_eq!(cfg.listen.port, 8080);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");

        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Pretty);

        assert_eq!(cfg.http.connect_timeout_secs, 10);
        assert!(cfg.http.user_agent.starts_with("canary/"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
[paths]
work_dir = "/srv/canary"

[listen]
host = "127.0.0.1"
port = 9090

[logging]
format = "json"
"#;

        let cfg: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.paths.work_dir, PathBuf::from("/srv/canary"));
        assert_eq!(cfg.paths.script, PathBuf::from("config.lua"));
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9090");
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.http, HttpConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canary.toml");
        std::fs::write(&path, "[http]\nconnect_timeout_secs = 3\n").unwrap();

        let cfg = DaemonConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(cfg.http.connect_timeout_secs, 3);
        assert!(cfg.http.build_client().is_ok());

        assert!(DaemonConfig::load(&dir.path().join("missing.toml")).is_err());
        std::fs::write(&path, "[listen]\nport = \"nope\"\n").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
