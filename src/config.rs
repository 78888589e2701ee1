//! Daemon configuration.
//!
//! Sources are layered, later ones winning:
//! built-in defaults, the TOML file, `BLOBSHIFT_*` environment variables
//! (`__` separates nested keys, e.g. `BLOBSHIFT_MIGRATION__VERIFY=checksum`),
//! then command-line overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::migration_log::DEFAULT_LOG_CAPACITY;
use crate::core::verifier::VerifyMode;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/blobshift/config.toml";
pub const ENV_PREFIX: &str = "BLOBSHIFT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Entries kept in the migration log
    pub log_capacity: usize,
    pub verify: VerifyMode,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            verify: VerifyMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the JSON-RPC server listens on, and clients connect to
    pub rpc_bind: SocketAddr,
    /// SQLite database holding the settings table
    pub settings_path: PathBuf,
    /// Local root used until a storage configuration is saved
    pub default_local_root: PathBuf,
    pub log_json: bool,
    pub verbose: bool,
    pub migration: MigrationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            settings_path: PathBuf::from("/var/lib/blobshift/settings.db"),
            default_local_root: PathBuf::from("/var/lib/blobshift/objects"),
            log_json: false,
            verbose: false,
            migration: MigrationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load with `path` as the TOML layer. A missing file is skipped.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "migration.log_capacity must be greater than zero".into(),
            ));
        }
        if self.default_local_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("default_local_root must be set".into()));
        }
        if self.settings_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("settings_path must be set".into()));
        }
        Ok(())
    }
}
