//! Bus settings and their TOML layers.
//!
//! Settings are resolved from three layers, later layers overriding earlier
//! ones key by key:
//!
//! 1. Programmed defaults
//! 2. User config (`$XDG_CONFIG_HOME/devbus/devbus.toml`)
//! 3. An explicit file (e.g. `devbus --config PATH`)

pub mod user;

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

pub use user::{load_user_config, user_config_path};

pub const DEFAULT_BROKER_URL: &str = "amqp://localhost:5672/%2f";
pub const DEFAULT_RPC_QUEUE_NAME: &str = "devbus.services";
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
/// Three hours.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 10_800_000;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SERVICE_TYPE: &str = "devbus";

/// Effective settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub broker_url: String,
    /// Prefix of the per-user queues receiving requests for hosted services.
    pub rpc_queue_name: String,
    pub exclusive_services_queue: bool,
    pub close_timeout_ms: u64,
    pub keep_alive: KeepAliveSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    /// Delay before each liveness probe.
    pub probe_interval_ms: u64,
    /// How long a probe may go unanswered before the process is terminated.
    pub response_timeout_ms: u64,
    /// Identifies this kind of process in probes.
    pub service_type: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            rpc_queue_name: DEFAULT_RPC_QUEUE_NAME.to_string(),
            exclusive_services_queue: false,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            keep_alive: KeepAliveSettings::default(),
        }
    }
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
        }
    }
}

impl KeepAliveSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl BusSettings {
    /// Parse a complete settings document; missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> BusResult<Self> {
        let layer = SettingsLayer::from_toml_str(contents)?;
        let settings = layer.apply(Self::default());
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overridden by the file at `path`.
    pub fn load(path: &Path) -> BusResult<Self> {
        let layer = SettingsLayer::load(path)?;
        let settings = layer.apply(Self::default());
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.rpc_queue_name.trim().is_empty() {
            return Err(BusError::config("rpc_queue_name must not be empty"));
        }
        if self.close_timeout_ms == 0 {
            return Err(BusError::config("close_timeout_ms must be greater than zero"));
        }
        if self.keep_alive.probe_interval_ms == 0 {
            return Err(BusError::config(
                "keep_alive.probe_interval_ms must be greater than zero",
            ));
        }
        if self.keep_alive.response_timeout_ms == 0 {
            return Err(BusError::config(
                "keep_alive.response_timeout_ms must be greater than zero",
            ));
        }
        if self.keep_alive.service_type.trim().is_empty() {
            return Err(BusError::config("keep_alive.service_type must not be empty"));
        }
        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn to_toml(&self) -> BusResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BusError::internal(format!("failed to serialize settings: {}", e)))
    }
}

/// One partial layer of settings, as read from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsLayer {
    pub broker_url: Option<String>,
    pub rpc_queue_name: Option<String>,
    pub exclusive_services_queue: Option<bool>,
    pub close_timeout_ms: Option<u64>,
    pub keep_alive: Option<KeepAliveLayer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepAliveLayer {
    pub probe_interval_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub service_type: Option<String>,
}

impl SettingsLayer {
    pub fn from_toml_str(contents: &str) -> BusResult<Self> {
        toml::from_str(contents).map_err(|e| BusError::config(e.to_string()))
    }

    pub fn load(path: &Path) -> BusResult<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| BusError::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
            .map_err(|e| BusError::config(format!("{}: {}", path.display(), e)))
    }

    /// Override `base` with every key this layer sets.
    pub fn apply(self, base: BusSettings) -> BusSettings {
        let keep_alive = self.keep_alive.unwrap_or_default();
        BusSettings {
            broker_url: self.broker_url.unwrap_or(base.broker_url),
            rpc_queue_name: self.rpc_queue_name.unwrap_or(base.rpc_queue_name),
            exclusive_services_queue: self
                .exclusive_services_queue
                .unwrap_or(base.exclusive_services_queue),
            close_timeout_ms: self.close_timeout_ms.unwrap_or(base.close_timeout_ms),
            keep_alive: KeepAliveSettings {
                probe_interval_ms: keep_alive
                    .probe_interval_ms
                    .unwrap_or(base.keep_alive.probe_interval_ms),
                response_timeout_ms: keep_alive
                    .response_timeout_ms
                    .unwrap_or(base.keep_alive.response_timeout_ms),
                service_type: keep_alive
                    .service_type
                    .unwrap_or(base.keep_alive.service_type),
            },
        }
    }
}

/// Merge two layers, preferring values from `primary` over `fallback`.
pub fn merge_settings(
    fallback: Option<SettingsLayer>,
    primary: Option<SettingsLayer>,
) -> Option<SettingsLayer> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(layer), None) | (None, Some(layer)) => Some(layer),
        (Some(fallback), Some(primary)) => Some(SettingsLayer {
            broker_url: primary.broker_url.or(fallback.broker_url),
            rpc_queue_name: primary.rpc_queue_name.or(fallback.rpc_queue_name),
            exclusive_services_queue: primary
                .exclusive_services_queue
                .or(fallback.exclusive_services_queue),
            close_timeout_ms: primary.close_timeout_ms.or(fallback.close_timeout_ms),
            keep_alive: merge_keep_alive(fallback.keep_alive, primary.keep_alive),
        }),
    }
}

fn merge_keep_alive(
    fallback: Option<KeepAliveLayer>,
    primary: Option<KeepAliveLayer>,
) -> Option<KeepAliveLayer> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(layer), None) | (None, Some(layer)) => Some(layer),
        (Some(fallback), Some(primary)) => Some(KeepAliveLayer {
            probe_interval_ms: primary.probe_interval_ms.or(fallback.probe_interval_ms),
            response_timeout_ms: primary.response_timeout_ms.or(fallback.response_timeout_ms),
            service_type: primary.service_type.or(fallback.service_type),
        }),
    }
}

/// Resolve the effective settings: defaults < user config < `explicit`.
///
/// An unreadable or invalid user config is logged and skipped; an explicit
/// file that cannot be loaded is an error.
pub fn load_settings(explicit: Option<&Path>) -> BusResult<BusSettings> {
    let user = match load_user_config() {
        Ok(layer) => layer,
        Err(e) => {
            log::warn!(target: "devbus::config", "Ignoring user config: {}", e);
            None
        }
    };
    let explicit = explicit.map(SettingsLayer::load).transpose()?;

    let settings = merge_settings(user, explicit)
        .unwrap_or_default()
        .apply(BusSettings::default());
    settings.validate()?;
    Ok(settings)
}
