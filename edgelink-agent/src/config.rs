//! Agent configuration
//!
//! Handles:
//! - Application identity used for registration
//! - Directory service and edge-events broker settings
//! - Migration policy (thresholds, telemetry loops, triggers)
//! - Device fallbacks (location, carrier) for hosts without sensors

use anyhow::{Context, Result};
use edgelink_sdk::models::{ClientIdentity, FindCloudletMode, Location};
use edgelink_sdk::{DirectoryConfig, EdgeEventsConfig, EventsConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit directory host; empty derives it from the carrier
    pub dme_host: String,
    pub dme_port: Option<u16>,
    pub find_mode: FindCloudletMode,
    pub app: AppConfig,
    pub directory: DirectoryConfig,
    pub device: DeviceConfig,
    pub events: EventsConfig,
    pub edge_events: EdgeEventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub org_name: String,
    pub app_name: String,
    pub app_vers: String,
    pub auth_token: Option<String>,
    /// Stable device id, generated on first run
    pub unique_id: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            org_name: "EdgeLink".to_string(),
            app_name: "edgelink-agent".to_string(),
            app_vers: env!("CARGO_PKG_VERSION").to_string(),
            auth_token: None,
            unique_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl AppConfig {
    pub fn identity(&self) -> ClientIdentity {
        let identity = ClientIdentity::new(&self.org_name, &self.app_name, &self.app_vers)
            .with_unique_id("edgelink-agent", &self.unique_id);
        match &self.auth_token {
            Some(token) => identity.with_auth_token(token),
            None => identity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `"{mcc}-{mnc}"` when the host sits behind a cellular modem
    pub mcc_mnc: Option<String>,
    pub carrier_name: String,
    /// Fixed position reported for this host
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { mcc_mnc: None, carrier_name: String::new(), latitude: 37.3382, longitude: -121.8863 }
    }
}

impl DeviceConfig {
    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude)
    }
}

impl AgentConfig {
    /// Load from the OS config directory, falling back to defaults on first run.
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            let config = Self::default();
            config.save_to(&path).await?;
            tracing::info!("📝 First run, default config written to {}", path.display());
            return Ok(config);
        }
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("edgelink-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn dme_host(&self) -> Option<&str> {
        Some(self.dme_host.as_str()).filter(|h| !h.is_empty())
    }
}
