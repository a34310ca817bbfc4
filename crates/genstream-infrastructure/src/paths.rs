//! Path resolution for genstream configuration files.
//!
//! ```text
//! $GENSTREAM_CONFIG             # explicit config file, wins when set
//! ~/.config/genstream/          # platform config dir (dirs::config_dir)
//! └── config.toml
//! ```

use std::path::PathBuf;

use thiserror::Error;

pub const CONFIG_ENV: &str = "GENSTREAM_CONFIG";
const APP_DIR: &str = "genstream";
const CONFIG_FILE: &str = "config.toml";

/// Errors that can occur during path resolution.
#[derive(Debug, Error)]
pub enum PathError {
    /// The platform has no config directory (no home directory).
    #[error("Cannot find config directory")]
    ConfigDirNotFound,
}

pub struct GenstreamPaths;

impl GenstreamPaths {
    /// Returns the genstream configuration directory (e.g. `~/.config/genstream/`).
    pub fn config_dir() -> Result<PathBuf, PathError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(PathError::ConfigDirNotFound)
    }

    /// Returns the config file path, honouring `GENSTREAM_CONFIG`.
    pub fn config_file() -> Result<PathBuf, PathError> {
        Self::config_file_from(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    fn config_file_from(explicit: Option<PathBuf>) -> Result<PathBuf, PathError> {
        match explicit {
            Some(path) if !path.as_os_str().is_empty() => Ok(path),
            _ => Ok(Self::config_dir()?.join(CONFIG_FILE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let path = GenstreamPaths::config_file_from(Some(PathBuf::from("/tmp/x.toml"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.toml"));
    }

    #[test]
    fn empty_explicit_path_is_ignored() {
        if let Ok(path) = GenstreamPaths::config_file_from(Some(PathBuf::new())) {
            assert!(path.ends_with("genstream/config.toml"));
        }
    }
}
