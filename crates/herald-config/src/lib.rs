//! KDL configuration parsing for the Herald outbox.
//!
//! This crate handles parsing of:
//! - System configuration (herald.kdl)
//! - Environment overrides (`HERALD_CONFIG`, `DATABASE_URL`)

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, DispatcherConfig, LogFormat, ServerConfig, SystemConfig, WebhookConfig,
    parse_system_config,
};

use std::path::Path;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "HERALD_CONFIG";

/// Read and parse a config file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Load config from `HERALD_CONFIG` (or defaults when unset), then apply
/// `DATABASE_URL`.
pub fn load_from_env() -> ConfigResult<SystemConfig> {
    let mut config = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_config(path)?,
        Err(_) => SystemConfig::default(),
    };
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database.url = url;
    }
    config.validate()?;
    Ok(config)
}
