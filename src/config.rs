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

//! Configuration: TOML file under the platform config directory.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::bluetooth::CentralConfig;

const APP_DIR: &str = "speech2prompt";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Data directory for credentials and history.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Link protocol timing.
    pub link: LinkConfig,

    /// History settings.
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Name advertised over BLE.
    pub device_name: String,

    /// Silently approve pairing from devices already in the credential
    /// store.
    pub auto_accept: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: "Speech2Prompt".to_string(),
            auto_accept: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connect_timeout_secs: u64,
    pub mtu_read_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub pair_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            mtu_read_timeout_secs: 5,
            ack_timeout_secs: 5,
            pair_timeout_secs: 30,
            heartbeat_interval_secs: 5,
            reconnect_attempts: 5,
            reconnect_base_delay_secs: 1,
        }
    }
}

impl LinkConfig {
    /// Lower into the central supervisor's tunables.
    pub fn to_central_config(&self) -> CentralConfig {
        CentralConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            mtu_read_timeout: Duration::from_secs(self.mtu_read_timeout_secs),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            pair_timeout: Duration::from_secs(self.pair_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_base_delay: Duration::from_secs(self.reconnect_base_delay_secs),
            ..CentralConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of rows kept.
    pub max_entries: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

impl Config {
    /// Load configuration from disk, writing defaults on first run.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let mut config: Config = if config_path.exists() {
            toml::from_str(&std::fs::read_to_string(&config_path)?)?
        } else {
            let config = Self::default();
            std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;
            config
        };

        config.data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }
}
