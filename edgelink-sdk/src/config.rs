//! Session configuration
//!
//! Supplied once when edge events start and read-only afterwards. Every
//! struct deserializes with defaults so a host config file only needs the
//! fields it overrides.

use crate::error::SetupError;
use crate::models::Location;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When a telemetry loop sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePattern {
    /// Repeatedly, every `interval_secs`
    OnInterval,
    /// Exactly once when the loop starts
    OnStart,
    /// Never on its own; only manual polls send
    OnTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub pattern: UpdatePattern,
    pub interval_secs: u64,
    /// 0 means unbounded for `OnInterval`
    pub max_updates: u32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            pattern: UpdatePattern::OnInterval,
            interval_secs: 30,
            max_updates: 0,
        }
    }
}

impl UpdateConfig {
    pub fn on_interval(interval_secs: u64, max_updates: u32) -> Self {
        Self { pattern: UpdatePattern::OnInterval, interval_secs, max_updates }
    }

    pub fn on_start() -> Self {
        Self { pattern: UpdatePattern::OnStart, ..Self::default() }
    }

    pub fn on_trigger() -> Self {
        Self { pattern: UpdatePattern::OnTrigger, ..Self::default() }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Number of scheduled sends; `None` is unbounded.
    pub fn seed_count(&self) -> Option<u32> {
        match self.pattern {
            UpdatePattern::OnTrigger => Some(0),
            UpdatePattern::OnStart => Some(1),
            UpdatePattern::OnInterval if self.max_updates == 0 => None,
            UpdatePattern::OnInterval => Some(self.max_updates),
        }
    }

    fn validate(&self, loop_name: &'static str) -> Result<(), SetupError> {
        if self.pattern == UpdatePattern::OnInterval && self.interval_secs == 0 {
            return Err(SetupError::InvalidUpdateInterval(loop_name));
        }
        Ok(())
    }
}

/// Server-side conditions that may lead to a new cloudlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindCloudletEventTrigger {
    AppInstHealthChanged,
    CloudletStateChanged,
    CloudletMaintenanceStateChanged,
    LatencyTooHigh,
    CloserCloudlet,
    Error,
}

impl FindCloudletEventTrigger {
    pub fn all() -> Vec<Self> {
        vec![
            Self::AppInstHealthChanged,
            Self::CloudletStateChanged,
            Self::CloudletMaintenanceStateChanged,
            Self::LatencyTooHigh,
            Self::CloserCloudlet,
            Self::Error,
        ]
    }
}

/// Policy knobs for the edge-events session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeEventsConfig {
    /// Average latency above which a performance check runs
    pub latency_threshold_ms: f64,
    /// Fraction by which a candidate must beat the current latency
    pub performance_switch_margin: f64,
    /// Port used for connect tests; 0 picks the first TCP port
    pub latency_test_port: u16,
    pub samples_per_test: u32,
    pub probe_timeout_ms: u64,
    pub location_update: UpdateConfig,
    pub latency_update: UpdateConfig,
    pub new_find_cloudlet_triggers: Vec<FindCloudletEventTrigger>,
    /// Migrate automatically or just notify the host
    pub auto_migration: bool,
    /// Used whenever the location provider has no fix
    pub default_location: Location,
}

impl Default for EdgeEventsConfig {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 50.0,
            performance_switch_margin: 0.05,
            latency_test_port: 0,
            samples_per_test: 5,
            probe_timeout_ms: 2_000,
            location_update: UpdateConfig::default(),
            latency_update: UpdateConfig::default(),
            new_find_cloudlet_triggers: FindCloudletEventTrigger::all(),
            auto_migration: true,
            default_location: Location::new(37.3382, -121.8863),
        }
    }
}

impl EdgeEventsConfig {
    pub fn validate(&self) -> Result<(), SetupError> {
        if !(self.latency_threshold_ms > 0.0) {
            return Err(SetupError::InvalidLatencyThreshold(self.latency_threshold_ms));
        }
        if !(0.0..=1.0).contains(&self.performance_switch_margin) {
            return Err(SetupError::InvalidSwitchMargin(self.performance_switch_margin));
        }
        if self.samples_per_test == 0 {
            return Err(SetupError::InvalidSamplesPerTest);
        }
        if self.new_find_cloudlet_triggers.is_empty() {
            return Err(SetupError::MissingTriggers);
        }
        self.location_update.validate("location")?;
        self.latency_update.validate("latency")?;
        Ok(())
    }

    pub fn trigger_enabled(&self, trigger: FindCloudletEventTrigger) -> bool {
        self.new_find_cloudlet_triggers.contains(&trigger)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Where the directory service lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Carrier hosts are generated as `{mcc}-{mnc}.{base_domain}`
    pub base_domain: String,
    pub port: u16,
    pub use_tls: bool,
    pub request_timeout_secs: u64,
    /// Candidates requested in performance mode
    pub app_inst_limit: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_domain: "dme.edgelink.net".to_string(),
            port: 38001,
            use_tls: true,
            request_timeout_secs: 10,
            app_inst_limit: 4,
        }
    }
}

impl DirectoryConfig {
    pub fn wifi_host(&self) -> String {
        format!("wifi.{}", self.base_domain)
    }

    pub fn carrier_host(&self, mcc_mnc: &str) -> String {
        format!("{}.{}", mcc_mnc, self.base_domain)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Edge-events broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broker host; empty uses the directory host of the session
    pub broker_host: String,
    pub broker_port: u16,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            broker_host: String::new(),
            broker_port: 1883,
            topic_prefix: "edgelink/events".to_string(),
            keep_alive_secs: 30,
        }
    }
}
