//! Canary configuration: the instance identity and the schedulable tests
//! produced by interpreting the configuration script.

mod loader;

use std::time::Duration;

use serde::Serialize;

use crate::script::duration::format_duration;
use crate::script::CompiledScript;

pub use self::loader::{ConfigError, ConfigInterpreter};

/// Default configuration script path, relative to the working directory.
pub const DEFAULT_SCRIPT: &str = "config.lua";

/// Global identity of the canary instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanaryConfig {
    pub name: String,
}

/// One `register_test` call: how often to run a script and for how long.
#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub name: String,
    pub frequency: Duration,
    pub timeout: Duration,
    pub body: CompiledScript,
}

/// Read-only view of a definition, with durations rendered the way they
/// are written in the configuration script.
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub name: String,
    pub frequency: String,
    pub timeout: String,
}

impl From<&TestDefinition> for TestSummary {
    fn from(test: &TestDefinition) -> Self {
        Self {
            name: test.name.clone(),
            frequency: format_duration(test.frequency),
            timeout: format_duration(test.timeout),
        }
    }
}
