//! Root configuration model.
//!
//! Loading lives in `genstream-infrastructure`; this module only defines the
//! shape of `config.toml`.

use serde::{Deserialize, Serialize};

use crate::catalog::ProgramCatalog;
use crate::channel::MIN_CAPACITY;
use crate::error::{GenerationError, Result};
use crate::program::{PreviewPolicy, ProgramSpec};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

/// Runtime knobs for the session manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Bound of each session's step-event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// When set, replaces the preview policy of the built-in programs.
    #[serde(default)]
    pub default_preview: Option<PreviewPolicy>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_preview: None,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity < MIN_CAPACITY {
            return Err(GenerationError::configuration(format!(
                "channel_capacity must be at least {MIN_CAPACITY}, got {}",
                self.channel_capacity
            )));
        }
        Ok(())
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub settings: SessionSettings,
    /// Extra or replacement programs, keyed by id.
    #[serde(default)]
    pub program: Vec<ProgramSpec>,
}

impl RootConfig {
    /// Builds the effective catalog: built-in programs overlaid with the
    /// programs from this config.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Configuration` if a configured program is invalid.
    pub fn catalog(&self) -> Result<ProgramCatalog> {
        let mut builtin = ProgramCatalog::builtin();
        if let Some(policy) = self.settings.default_preview {
            let specs = builtin.iter().cloned().map(|mut spec| {
                spec.preview = policy;
                spec
            });
            builtin = ProgramCatalog::from_specs(specs.collect::<Vec<_>>())?;
        }
        let configured = ProgramCatalog::from_specs(self.program.iter().cloned())?;
        Ok(builtin.merge(configured))
    }
}
