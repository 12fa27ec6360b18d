//! Device identification for the agent host
//!
//! This module handles:
//! - Network interface enumeration and classification (Ethernet > WiFi > Other)
//! - Mapping the active interface to the data network type reported upstream
//! - Static device details (OS, hostname) for the edge-events handshake

use crate::config::DeviceConfig;
use edgelink_sdk::models::{DeviceInfoDynamic, DeviceInfoStatic};
use edgelink_sdk::DeviceInfoProvider;
use if_addrs::get_if_addrs;
use tracing::{debug, warn};

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Cellular,
    Loopback,
    Other,
}

impl InterfaceType {
    /// Classify interface type based on name patterns
    pub fn classify(name: &str) -> Self {
        let name_lower = name.to_lowercase();

        if name_lower == "lo" || name_lower.starts_with("lo0") {
            return InterfaceType::Loopback;
        }
        if name_lower.starts_with("wwan") || name_lower.starts_with("rmnet") || name_lower.starts_with("ppp") {
            return InterfaceType::Cellular;
        }
        if name_lower.contains("wlan") || name_lower.contains("wifi") || name_lower.starts_with("wlp") || name_lower.starts_with("wlo") {
            return InterfaceType::Wireless;
        }
        if name_lower.starts_with("eth") || name_lower.starts_with("en") {
            return InterfaceType::Ethernet;
        }
        InterfaceType::Other
    }

    /// Value of `data_network_type` for this interface
    pub fn network_type(&self) -> &'static str {
        match self {
            InterfaceType::Ethernet => "ETHERNET",
            InterfaceType::Wireless => "WIFI",
            InterfaceType::Cellular => "CELLULAR",
            InterfaceType::Loopback | InterfaceType::Other => "UNKNOWN",
        }
    }

    fn priority(&self) -> u8 {
        match self {
            InterfaceType::Ethernet => 0,
            InterfaceType::Wireless => 1,
            InterfaceType::Cellular => 2,
            InterfaceType::Other => 3,
            InterfaceType::Loopback => 4,
        }
    }
}

/// Best active interface among `names`
pub fn primary_interface<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<InterfaceType> {
    names
        .into_iter()
        .map(InterfaceType::classify)
        .filter(|kind| *kind != InterfaceType::Loopback)
        .min_by_key(InterfaceType::priority)
}

/// `DeviceInfoProvider` backed by the host's network interfaces
pub struct HostDevice {
    config: DeviceConfig,
    hostname: String,
}

impl HostDevice {
    pub fn new(config: DeviceConfig) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Self { config, hostname }
    }

    fn current_network_type(&self) -> &'static str {
        let addrs = match get_if_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Failed to enumerate network interfaces: {}", e);
                return InterfaceType::Other.network_type();
            }
        };
        let active = primary_interface(addrs.iter().filter(|a| !a.is_loopback()).map(|a| a.name.as_str()))
            .unwrap_or(InterfaceType::Other);
        debug!("Active interface type: {:?}", active);
        active.network_type()
    }
}

impl DeviceInfoProvider for HostDevice {
    fn device_info_static(&self) -> DeviceInfoStatic {
        DeviceInfoStatic {
            device_os: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            device_model: self.hostname.clone(),
        }
    }

    fn device_info_dynamic(&self) -> DeviceInfoDynamic {
        DeviceInfoDynamic {
            data_network_type: self.current_network_type().to_string(),
            carrier_name: self.config.carrier_name.clone(),
            signal_strength: None,
        }
    }

    fn mcc_mnc(&self) -> Option<String> {
        self.config.mcc_mnc.clone().filter(|m| !m.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_classification() {
        assert_eq!(InterfaceType::classify("eth0"), InterfaceType::Ethernet);
        assert_eq!(InterfaceType::classify("enp3s0"), InterfaceType::Ethernet);
        assert_eq!(InterfaceType::classify("wlan0"), InterfaceType::Wireless);
        assert_eq!(InterfaceType::classify("wwan0"), InterfaceType::Cellular);
        assert_eq!(InterfaceType::classify("lo"), InterfaceType::Loopback);
        assert_eq!(InterfaceType::classify("docker0"), InterfaceType::Other);
    }

    #[test]
    fn test_primary_interface_priority() {
        assert_eq!(primary_interface(["docker0", "wlan0", "eth0"]), Some(InterfaceType::Ethernet));
        assert_eq!(primary_interface(["lo", "wlp2s0"]), Some(InterfaceType::Wireless));
        assert_eq!(primary_interface(["lo"]), None);
        assert_eq!(InterfaceType::Wireless.network_type(), "WIFI");
    }

    #[test]
    fn test_mcc_mnc_from_config() {
        let device = HostDevice::new(DeviceConfig { mcc_mnc: Some(String::new()), ..DeviceConfig::default() });
        assert!(device.mcc_mnc().is_none());

        let device = HostDevice::new(DeviceConfig { mcc_mnc: Some("310-260".into()), ..DeviceConfig::default() });
        assert_eq!(device.mcc_mnc().as_deref(), Some("310-260"));
        assert!(!device.device_info_static().device_os.is_empty());
    }
}
