use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use genstream_application::{ConnectionRegistry, PipelineCache, SessionManager};
use genstream_infrastructure::{ConfigService, SimulatedEngine, SimulatedEngineConfig};

pub fn config_service(path: Option<PathBuf>) -> ConfigService {
    match path {
        Some(path) => ConfigService::with_path(path),
        None => ConfigService::new(),
    }
}

/// Wires a session manager over the simulated engine using the effective config.
pub fn build_manager(
    config: &ConfigService,
    step_delay_ms: u64,
) -> Result<SessionManager<SimulatedEngine>> {
    let root = config.load().context("Failed to load configuration")?;
    let catalog = root.catalog().context("Invalid program catalog")?;

    let engine = Arc::new(SimulatedEngine::new(SimulatedEngineConfig {
        step_delay: Duration::from_millis(step_delay_ms),
        ..SimulatedEngineConfig::default()
    }));
    Ok(SessionManager::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(PipelineCache::new(engine)),
        catalog,
        root.settings,
    ))
}
