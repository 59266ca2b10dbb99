//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

/// Errors raised while loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("failed to parse config: {0}")]
    ParseStr(#[source] Box<toml::de::Error>),
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::ParseStr(Box::new(source)))
}
