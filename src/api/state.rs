use std::sync::Arc;

use crate::canary::{CanaryConfig, TestSummary};
use crate::metrics::Metrics;
use crate::storage::CanaryStore;

#[derive(Clone)]
pub struct AppState {
    pub canary: Arc<CanaryConfig>,
    pub tests: Arc<Vec<TestSummary>>,
    pub store: Arc<dyn CanaryStore>,
    pub metrics: Arc<Metrics>,
}
