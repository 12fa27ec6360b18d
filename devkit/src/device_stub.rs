/*!
Mock device collaborators: location, device info, latency probe
*/

use async_trait::async_trait;
use edgelink_sdk::device::{DeviceInfoProvider, LocationProvider};
use edgelink_sdk::error::ProbeError;
use edgelink_sdk::models::{DeviceInfoDynamic, DeviceInfoStatic, Location};
use edgelink_sdk::probe::TransportProbe;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Location provider whose fix the test moves around
pub struct FixedLocation {
    location: Mutex<Option<Location>>,
}

impl FixedLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { location: Mutex::new(Some(Location::new(latitude, longitude))) }
    }

    /// Provider with no fix at all
    pub fn unavailable() -> Self {
        Self { location: Mutex::new(None) }
    }

    pub fn move_to(&self, latitude: f64, longitude: f64) {
        *self.location.lock() = Some(Location::new(latitude, longitude));
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Option<Location> {
        self.location.lock().clone()
    }
}

pub struct MockDeviceInfo {
    pub mcc_mnc: Option<String>,
    pub carrier_name: String,
    pub data_network_type: String,
}

impl MockDeviceInfo {
    /// Device on wifi, no carrier
    pub fn wifi() -> Self {
        Self { mcc_mnc: None, carrier_name: String::new(), data_network_type: "WIFI".into() }
    }

    pub fn cellular(mcc_mnc: &str, carrier_name: &str) -> Self {
        Self {
            mcc_mnc: Some(mcc_mnc.to_string()),
            carrier_name: carrier_name.to_string(),
            data_network_type: "NR".into(),
        }
    }
}

impl DeviceInfoProvider for MockDeviceInfo {
    fn device_info_static(&self) -> DeviceInfoStatic {
        DeviceInfoStatic { device_os: "linux".into(), device_model: "edgelink-devkit".into() }
    }

    fn device_info_dynamic(&self) -> DeviceInfoDynamic {
        DeviceInfoDynamic {
            data_network_type: self.data_network_type.clone(),
            carrier_name: self.carrier_name.clone(),
            signal_strength: Some(-70),
        }
    }

    fn mcc_mnc(&self) -> Option<String> {
        self.mcc_mnc.clone()
    }
}

/// Probe answering per-host latencies without touching the network
pub struct MockProbe {
    latencies: Mutex<HashMap<String, f64>>,
    default_ms: f64,
    connect_calls: AtomicUsize,
    ping_calls: AtomicUsize,
}

impl MockProbe {
    pub fn new(default_ms: f64) -> Self {
        Self {
            latencies: Mutex::new(HashMap::new()),
            default_ms,
            connect_calls: AtomicUsize::new(0),
            ping_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_latency(&self, host: &str, ms: f64) {
        self.latencies.lock().insert(host.to_string(), ms);
    }

    /// Hosts set to a negative latency fail their probes.
    pub fn set_unreachable(&self, host: &str) {
        self.set_latency(host, -1.0);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn ping_calls(&self) -> usize {
        self.ping_calls.load(Ordering::SeqCst)
    }

    fn answer(&self, host: &str) -> Result<f64, ProbeError> {
        let ms = self.latencies.lock().get(host).copied().unwrap_or(self.default_ms);
        if ms < 0.0 {
            return Err(ProbeError::Timeout(host.to_string()));
        }
        Ok(ms)
    }
}

#[async_trait]
impl TransportProbe for MockProbe {
    async fn connect_test(&self, host: &str, _port: u16) -> Result<f64, ProbeError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(host)
    }

    async fn ping_test(&self, host: &str) -> Result<f64, ProbeError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(host)
    }
}
