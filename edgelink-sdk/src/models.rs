//! Core data model shared by every EdgeLink component
//!
//! Descriptors are immutable snapshots: a newly resolved cloudlet always
//! replaces the previous one instead of mutating it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GPS position of the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_accuracy: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            horizontal_accuracy: None,
            timestamp: Utc::now(),
        }
    }

    /// `(0, 0)` is what most platform providers hand back before a fix.
    pub fn is_unavailable(&self) -> bool {
        (self.latitude == 0.0 && self.longitude == 0.0)
            || !self.latitude.is_finite()
            || !self.longitude.is_finite()
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &Location) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Identity presented to the directory service on registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub org_name: String,
    pub app_name: String,
    pub app_vers: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id_type: Option<String>,
}

impl ClientIdentity {
    pub fn new(org_name: impl Into<String>, app_name: impl Into<String>, app_vers: impl Into<String>) -> Self {
        Self {
            org_name: org_name.into(),
            app_name: app_name.into(),
            app_vers: app_vers.into(),
            auth_token: None,
            unique_id: None,
            unique_id_type: None,
        }
    }

    pub fn with_unique_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.unique_id_type = Some(id_type.into());
        self.unique_id = Some(id.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Layer-4 protocol exposed by an application port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LProto {
    #[serde(rename = "L_PROTO_TCP")]
    Tcp,
    #[serde(rename = "L_PROTO_UDP")]
    Udp,
    #[serde(rename = "L_PROTO_HTTP")]
    Http,
    #[serde(rename = "L_PROTO_UNKNOWN", other)]
    Unknown,
}

/// One port exposed by an application instance on a cloudlet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppPort {
    pub proto: LProto,
    #[serde(default)]
    pub internal_port: u16,
    pub public_port: u16,
    #[serde(default)]
    pub fqdn_prefix: String,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub end_port: u16,
    #[serde(default)]
    pub tls: bool,
}

impl AppPort {
    pub fn tcp(public_port: u16) -> Self {
        Self {
            proto: LProto::Tcp,
            internal_port: public_port,
            public_port,
            fqdn_prefix: String::new(),
            path_prefix: String::new(),
            end_port: 0,
            tls: false,
        }
    }

    pub fn udp(public_port: u16) -> Self {
        Self { proto: LProto::Udp, ..Self::tcp(public_port) }
    }
}

/// Resolved edge endpoint for the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudletDescriptor {
    pub fqdn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudlet_name: Option<String>,
    #[serde(default)]
    pub ports: Vec<AppPort>,
    pub location: Location,
    /// Cookie for the edge-events stream of this cloudlet, when the
    /// directory issued one together with the descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_events_cookie: Option<String>,
    #[serde(default = "Utc::now")]
    pub resolved_at: DateTime<Utc>,
}

impl CloudletDescriptor {
    pub fn new(fqdn: impl Into<String>, ports: Vec<AppPort>, location: Location) -> Self {
        Self {
            fqdn: fqdn.into(),
            cloudlet_name: None,
            ports,
            location,
            edge_events_cookie: None,
            resolved_at: Utc::now(),
        }
    }

    /// Host for a port, honouring its fqdn prefix.
    pub fn host_for(&self, port: &AppPort) -> String {
        format!("{}{}", port.fqdn_prefix, self.fqdn)
    }

    pub fn first_port(&self, proto: LProto) -> Option<&AppPort> {
        self.ports.iter().find(|p| p.proto == proto)
    }

    pub fn find_port(&self, public_port: u16) -> Option<&AppPort> {
        self.ports.iter().find(|p| {
            p.public_port == public_port
                || (p.end_port != 0 && (p.public_port..=p.end_port).contains(&public_port))
        })
    }

    pub fn same_endpoint(&self, other: &CloudletDescriptor) -> bool {
        self.fqdn.eq_ignore_ascii_case(&other.fqdn)
    }
}

/// Device details that do not change during a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfoStatic {
    pub device_os: String,
    pub device_model: String,
}

/// Device details sampled on every telemetry send
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfoDynamic {
    pub data_network_type: String,
    #[serde(default)]
    pub carrier_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

/// Single round-trip measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    /// Milliseconds
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated latency statistics, computed client side for candidate tests
/// and server side for `EVENT_LATENCY_PROCESSED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub variance: f64,
    pub num_samples: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl LatencyStats {
    pub fn from_samples(samples: &[LatencySample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let avg = samples.iter().map(|s| s.value).sum::<f64>() / n;
        let min = samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
        let max = samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max);
        // Sample variance; a single sample has none.
        let variance = if samples.len() > 1 {
            samples.iter().map(|s| (s.value - avg).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };

        Some(Self {
            avg,
            min,
            max,
            std_dev: variance.sqrt(),
            variance,
            num_samples: samples.len() as u64,
            timestamp: Utc::now(),
        })
    }
}

/// How FindCloudlet picks among candidate cloudlets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindCloudletMode {
    /// Directory's GPS-nearest pick
    #[default]
    Proximity,
    /// Probe every candidate and keep the lowest average latency
    Performance,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64) -> LatencySample {
        LatencySample { value, timestamp: Utc::now() }
    }

    #[test]
    fn test_stats_from_samples() {
        let stats = LatencyStats::from_samples(&[sample(10.0), sample(20.0), sample(30.0)]).unwrap();
        assert_eq!(stats.avg, 20.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.variance, 100.0);
        assert_eq!(stats.std_dev, 10.0);
        assert_eq!(stats.num_samples, 3);

        assert!(LatencyStats::from_samples(&[]).is_none());
    }

    #[test]
    fn test_unavailable_location() {
        assert!(Location::new(0.0, 0.0).is_unavailable());
        assert!(Location::new(f64::NAN, 2.0).is_unavailable());
        assert!(!Location::new(37.33, -121.88).is_unavailable());
    }

    #[test]
    fn test_distance() {
        let san_jose = Location::new(37.3382, -121.8863);
        let palo_alto = Location::new(37.4419, -122.1430);
        let d = san_jose.distance_km(&palo_alto);
        assert!(d > 20.0 && d < 30.0, "unexpected distance {d}");
    }

    #[test]
    fn test_port_lookup() {
        let mut ranged = AppPort::udp(9000);
        ranged.end_port = 9010;
        let cloudlet = CloudletDescriptor::new(
            "edge1.example.net",
            vec![AppPort::tcp(8008), ranged],
            Location::new(37.33, -121.88),
        );
        assert_eq!(cloudlet.first_port(LProto::Tcp).unwrap().public_port, 8008);
        assert_eq!(cloudlet.find_port(9005).unwrap().proto, LProto::Udp);
        assert!(cloudlet.find_port(7000).is_none());
    }

    #[test]
    fn test_lproto_wire_names() {
        let port: AppPort = serde_json::from_str(r#"{"proto":"L_PROTO_TCP","public_port":8008}"#).unwrap();
        assert_eq!(port.proto, LProto::Tcp);
        let port: AppPort = serde_json::from_str(r#"{"proto":"L_PROTO_SCTP","public_port":1}"#).unwrap();
        assert_eq!(port.proto, LProto::Unknown);
    }
}
