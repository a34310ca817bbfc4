//! Configuration service implementation.
//!
//! Loads the root configuration from `config.toml` (see [`GenstreamPaths`])
//! and applies environment overrides on top.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use genstream_core::{GenerationError, ProgramCatalog, RootConfig};
use thiserror::Error;

use crate::paths::{GenstreamPaths, PathError};

pub const CHANNEL_CAPACITY_ENV: &str = "GENSTREAM_CHANNEL_CAPACITY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error(transparent)]
    Invalid(#[from] GenerationError),
}

/// Configuration service that loads and caches the root configuration.
///
/// The file is read lazily on first access and cached until
/// [`invalidate_cache`](Self::invalidate_cache) is called. A missing file
/// yields the defaults.
#[derive(Debug, Clone)]
pub struct ConfigService {
    path: Option<PathBuf>,
    config: Arc<RwLock<Option<RootConfig>>>,
}

impl ConfigService {
    /// Creates a service reading from the default location.
    pub fn new() -> Self {
        Self {
            path: None,
            config: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates a service reading from an explicit file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            config: Arc::new(RwLock::new(None)),
        }
    }

    /// The file this service reads.
    pub fn config_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(GenstreamPaths::config_file()?),
        }
    }

    /// Returns the root configuration, loading it if not cached.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed, or if an
    /// environment override or a setting is invalid.
    pub fn load(&self) -> Result<RootConfig, ConfigError> {
        {
            let cached = self.config.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(config) = cached.as_ref() {
                return Ok(config.clone());
            }
        }

        let path = self.config_path()?;
        let mut loaded = read_config(&path)?;
        apply_env_overrides(&mut loaded, |var| std::env::var(var).ok())?;
        loaded.settings.validate()?;

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(loaded.clone());
        Ok(loaded)
    }

    /// Like [`load`](Self::load) but falls back to defaults on error.
    pub fn get_config(&self) -> RootConfig {
        self.load().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load config, using defaults");
            RootConfig::default()
        })
    }

    /// The effective program catalog.
    pub fn catalog(&self) -> Result<ProgramCatalog, ConfigError> {
        Ok(self.load()?.catalog()?)
    }

    /// Invalidates the cache, forcing a reload on next access.
    pub fn invalidate_cache(&self) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new()
    }
}

fn read_config(path: &Path) -> Result<RootConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(RootConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

fn apply_env_overrides(
    config: &mut RootConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(CHANNEL_CAPACITY_ENV) {
        config.settings.channel_capacity =
            value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: CHANNEL_CAPACITY_ENV.to_string(),
                value,
            })?;
    }
    Ok(())
}
