// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving daemon settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::{timing, DEFAULT_NAME_PREFIX, SERVICE_UUID};
use crate::bluetooth::{ConnectionPolicy, ScanFilter};
use crate::engine::EngineSettings;

const APP_DIR: &str = "smartbottle-link";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the drink history and known device.
    #[serde(skip)]
    pub data_dir: PathBuf,

    pub bluetooth: BluetoothConfig,

    pub sync: SyncConfig,

    pub calibration: CalibrationConfig,

    pub health: HealthConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Advertised name prefix of the bottle.
    pub name_prefix: String,

    /// Also accept devices advertising the bottle service.
    pub filter_by_service: bool,

    /// Reconnect after an unexpected disconnect.
    pub auto_reconnect: bool,

    pub reconnect_grace_ms: u64,

    pub reconnect_scan_secs: u64,

    pub scan_timeout_secs: u64,

    pub connection_timeout_secs: u64,

    /// Release the bottle after this long without activity.
    pub idle_disconnect_secs: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            filter_by_service: true,
            auto_reconnect: true,
            reconnect_grace_ms: timing::RECONNECT_GRACE.as_millis() as u64,
            reconnect_scan_secs: timing::RECONNECT_SCAN.as_secs(),
            scan_timeout_secs: timing::SCAN_TIMEOUT.as_secs(),
            connection_timeout_secs: timing::CONNECTION_TIMEOUT.as_secs(),
            idle_disconnect_secs: timing::IDLE_DISCONNECT.as_secs(),
        }
    }
}

impl BluetoothConfig {
    fn scan_filter(&self) -> ScanFilter {
        let name_prefix = Some(self.name_prefix.trim())
            .filter(|prefix| !prefix.is_empty())
            .map(str::to_string);
        ScanFilter {
            name_prefix,
            service: self.filter_by_service.then_some(SERVICE_UUID),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pull records as soon as the bottle reports unsynced ones.
    pub auto_sync_on_connect: bool,

    pub chunk_inactivity_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_on_connect: true,
            chunk_inactivity_secs: timing::SYNC_INACTIVITY.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Used until the bottle config has been read.
    pub default_capacity_ml: u16,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            default_capacity_ml: 830,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "smartbottle_link=info".to_string(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let mut config = Self::load_from(&config_dir.join("config.toml"))?;

        config.data_dir = data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&config)?)?;
            Ok(config)
        }
    }

    /// Runtime settings for the engine.
    pub fn engine_settings(&self) -> EngineSettings {
        let bt = &self.bluetooth;
        EngineSettings {
            connection: ConnectionPolicy {
                filter: bt.scan_filter(),
                scan_timeout: Duration::from_secs(bt.scan_timeout_secs),
                connection_timeout: Duration::from_secs(bt.connection_timeout_secs),
                idle_disconnect: Duration::from_secs(bt.idle_disconnect_secs),
                auto_reconnect: bt.auto_reconnect,
                reconnect_grace: Duration::from_millis(bt.reconnect_grace_ms),
                reconnect_scan: Duration::from_secs(bt.reconnect_scan_secs),
            },
            auto_sync: self.sync.auto_sync_on_connect,
            sync_inactivity: Duration::from_secs(self.sync.chunk_inactivity_secs),
            default_capacity_ml: self.calibration.default_capacity_ml,
            ..EngineSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let settings = Config::default().engine_settings();
        let defaults = EngineSettings::default();

        assert_eq!(settings.connection.filter, defaults.connection.filter);
        assert_eq!(settings.connection.scan_timeout, Duration::from_secs(10));
        assert_eq!(settings.connection.idle_disconnect, Duration::from_secs(60));
        assert_eq!(
            settings.connection.reconnect_grace,
            Duration::from_millis(1500)
        );
        assert_eq!(settings.sync_inactivity, defaults.sync_inactivity);
        assert_eq!(settings.default_capacity_ml, 830);
        assert!(settings.auto_sync);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bluetooth]
            name_prefix = "MyBottle"
            filter_by_service = false
            idle_disconnect_secs = 120

            [health]
            enabled = true
            "#,
        )
        .unwrap();

        assert!(config.health.enabled);
        assert!(config.bluetooth.auto_reconnect);
        assert_eq!(config.calibration.default_capacity_ml, 830);

        let settings = config.engine_settings();
        assert_eq!(
            settings.connection.filter,
            ScanFilter {
                name_prefix: Some("MyBottle".to_string()),
                service: None,
            }
        );
        assert_eq!(
            settings.connection.idle_disconnect,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.bluetooth.name_prefix, "Aquavate");

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.logging.level, created.logging.level);
        assert_eq!(
            reloaded.sync.chunk_inactivity_secs,
            created.sync.chunk_inactivity_secs
        );
    }
}
