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
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the responder listens and the initiator dials.
    pub link: LinkConfig,

    /// Protocol timeouts and cadences.
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Peer host or bind address.
    pub host: String,

    /// Peer port or bind port.
    pub port: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9737,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long either side waits for a handshake to finish.
    pub handshake_timeout_secs: u64,

    /// How long the initiator waits for traffic while streaming before
    /// declaring the stream ended.
    pub stream_recv_timeout_secs: u64,

    /// Delay between frames on the responder's data pump.
    pub pump_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 20,
            stream_recv_timeout_secs: 1000,
            pump_interval_ms: 1,
        }
    }
}

impl TimingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stream_recv_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_recv_timeout_secs)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulselink");

        std::fs::create_dir_all(&config_dir)?;

        Self::load_path(&config_dir.join("config.toml"))
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulselink");

        std::fs::create_dir_all(&config_dir)?;
        self.save_path(&config_dir.join("config.toml"))
    }

    fn load_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_path(path)?;
            Ok(config)
        }
    }

    fn save_path(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
