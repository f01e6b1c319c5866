//! Application state.

use std::sync::Arc;

use crate::config::ApiConfig;
use crate::orchestrator::Orchestrator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: ApiConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }
}
