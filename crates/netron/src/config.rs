//! Configuration loading from `~/.netron/config.toml` with defaults.

use netron_types::NetronConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load node configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is logged and yields the defaults.
pub fn load_config(path: Option<&Path>) -> NetronConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<NetronConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    NetronConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    netron_home().join("config.toml")
}

/// Get the default Netron home directory.
pub fn netron_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".netron")
}
