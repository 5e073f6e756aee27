//! User configuration loading for devbus.
//!
//! User config location: $XDG_CONFIG_HOME/devbus/devbus.toml
//! Fallback: the platform config directory (~/.config on Linux).

use std::path::PathBuf;

use super::SettingsLayer;
use crate::error::BusResult;

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/devbus/devbus.toml
/// 2. Otherwise: <platform config dir>/devbus/devbus.toml
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg_config) if !xdg_config.is_empty() => PathBuf::from(xdg_config),
        _ => dirs::config_dir()?,
    };
    Some(base.join("devbus").join("devbus.toml"))
}

/// Load the user config layer.
///
/// Returns `Ok(None)` when there is no user config file.
pub fn load_user_config() -> BusResult<Option<SettingsLayer>> {
    let Some(path) = user_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    log::debug!(target: "devbus::config", "Loading user config from {}", path.display());
    SettingsLayer::load(&path).map(Some)
}
