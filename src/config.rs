//! Configuration management for the KBI host
//!
//! Handles loading and parsing of the YAML configuration file. Every field has
//! a default, so an empty file (or no file at all) gives the reference setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::framing::FramingPolicy;
use crate::protocol::DEVICE_PORT_NAME;
use crate::session::DEFAULT_LIVENESS_TIMEOUT;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub midi: MidiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

/// MIDI port configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MidiConfig {
    /// Case-insensitive substring matched against input and output port names
    #[serde(default = "default_port_name")]
    pub port_name: String,
    /// Client name registered with the MIDI services
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

/// Session timing and framing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Ticks without a status reply before the device is presumed gone
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ticks: u64,
    #[serde(default)]
    pub framing: FramingPolicy,
}

/// Display counter and button chase shown while a keyboard is connected
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DemoConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            client_name: default_client_name(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            liveness_timeout_ticks: default_liveness_timeout(),
            framing: FramingPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl AppConfig {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse YAML config: {}", path))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            info!("Config file '{}' not found, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Parse configuration from a YAML string
    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }
}

// Default value functions
fn default_port_name() -> String { DEVICE_PORT_NAME.to_string() }
fn default_client_name() -> String { "KBI-1 Host".to_string() }
fn default_tick_ms() -> u64 { 1000 }
fn default_liveness_timeout() -> u64 { DEFAULT_LIVENESS_TIMEOUT }
