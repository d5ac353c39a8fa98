use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::Config;

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV: &str = "ADPACER_CONFIG";

/// Get the canonical config file path (~/.adpacer/config.json)
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".adpacer").join("config.json"))
}

/// Load configuration.
///
/// `ADPACER_CONFIG` wins and must exist. Otherwise `~/.adpacer/config.json`
/// is used if present, and defaults apply when it is not.
pub fn load_config() -> Result<Config, ConfigError> {
    if let Some(explicit) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return load_config_from(Path::new(&explicit));
    }

    let path = config_path()?;
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    load_config_from(&path)
}

/// Load and validate configuration from a specific file.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    let content = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}
