pub mod config_service;
pub mod paths;
pub mod simulated_engine;

pub use config_service::{ConfigError, ConfigService};
pub use paths::GenstreamPaths;
pub use simulated_engine::{EngineStats, SimulatedEngine, SimulatedEngineConfig};
