//! Edge-events wire format (JSON frames)
//!
//! Client → server: `EVENT_INIT_CONNECTION`, `EVENT_TERMINATE_CONNECTION`,
//! `EVENT_LOCATION_UPDATE`, `EVENT_LATENCY_SAMPLES`.
//!
//! Server → client frames are decoded loosely (string tag + optional
//! fields) and then classified into exactly one `ServerTrigger`, so an
//! unknown tag is a recoverable classification error rather than a
//! deserialization failure of the whole stream.

use crate::config::FindCloudletEventTrigger;
use crate::directory::{DirectoryStatus, FindCloudletReply};
use crate::models::{CloudletDescriptor, DeviceInfoDynamic, DeviceInfoStatic, LatencySample, LatencyStats, Location};
use crate::registry::SessionCookies;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_INIT_CONNECTION: &str = "EVENT_INIT_CONNECTION";
pub const EVENT_TERMINATE_CONNECTION: &str = "EVENT_TERMINATE_CONNECTION";
pub const EVENT_LOCATION_UPDATE: &str = "EVENT_LOCATION_UPDATE";
pub const EVENT_LATENCY_SAMPLES: &str = "EVENT_LATENCY_SAMPLES";
pub const EVENT_APPINST_HEALTH: &str = "EVENT_APPINST_HEALTH";
pub const EVENT_CLOUDLET_MAINTENANCE: &str = "EVENT_CLOUDLET_MAINTENANCE";
pub const EVENT_CLOUDLET_STATE: &str = "EVENT_CLOUDLET_STATE";
pub const EVENT_LATENCY_REQUEST: &str = "EVENT_LATENCY_REQUEST";
pub const EVENT_LATENCY_PROCESSED: &str = "EVENT_LATENCY_PROCESSED";
pub const EVENT_CLOUDLET_UPDATE: &str = "EVENT_CLOUDLET_UPDATE";
pub const EVENT_ERROR: &str = "EVENT_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientEventType {
    #[serde(rename = "EVENT_INIT_CONNECTION")]
    InitConnection,
    #[serde(rename = "EVENT_TERMINATE_CONNECTION")]
    TerminateConnection,
    #[serde(rename = "EVENT_LOCATION_UPDATE")]
    LocationUpdate,
    #[serde(rename = "EVENT_LATENCY_SAMPLES")]
    LatencySamples,
}

/// Frame sent by the SDK
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEdgeEvent {
    pub event_type: ClientEventType,
    pub session_cookie: String,
    pub edge_events_cookie: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_location: Option<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<LatencySample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info_static: Option<DeviceInfoStatic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info_dynamic: Option<DeviceInfoDynamic>,
    pub timestamp: DateTime<Utc>,
}

impl ClientEdgeEvent {
    fn base(event_type: ClientEventType, cookies: &SessionCookies) -> Self {
        Self {
            event_type,
            session_cookie: cookies.session_cookie.clone(),
            edge_events_cookie: cookies.edge_events_cookie.clone(),
            gps_location: None,
            samples: Vec::new(),
            device_info_static: None,
            device_info_dynamic: None,
            timestamp: Utc::now(),
        }
    }

    pub fn init_connection(cookies: &SessionCookies, device_static: DeviceInfoStatic, device_dynamic: DeviceInfoDynamic) -> Self {
        Self {
            device_info_static: Some(device_static),
            device_info_dynamic: Some(device_dynamic),
            ..Self::base(ClientEventType::InitConnection, cookies)
        }
    }

    pub fn terminate_connection(cookies: &SessionCookies) -> Self {
        Self::base(ClientEventType::TerminateConnection, cookies)
    }

    pub fn location_update(cookies: &SessionCookies, location: Location, device_dynamic: DeviceInfoDynamic) -> Self {
        Self {
            gps_location: Some(location),
            device_info_dynamic: Some(device_dynamic),
            ..Self::base(ClientEventType::LocationUpdate, cookies)
        }
    }

    pub fn latency_samples(
        cookies: &SessionCookies,
        samples: Vec<LatencySample>,
        location: Location,
        device_dynamic: DeviceInfoDynamic,
    ) -> Self {
        Self {
            gps_location: Some(location),
            samples,
            device_info_dynamic: Some(device_dynamic),
            ..Self::base(ClientEventType::LatencySamples, cookies)
        }
    }

    /// Telemetry frames can be held back while sending is paused; the
    /// connection lifecycle frames cannot.
    pub fn is_telemetry(&self) -> bool {
        matches!(self.event_type, ClientEventType::LocationUpdate | ClientEventType::LatencySamples)
    }
}

/// Frame received from the server, before classification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerEdgeEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudlet_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<LatencyStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_cloudlet: Option<FindCloudletReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl ServerEdgeEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), ..Default::default() }
    }

    pub fn with_new_cloudlet(mut self, reply: FindCloudletReply) -> Self {
        self.new_cloudlet = Some(reply);
        self
    }

    /// Classify into the trigger the dispatcher consumes.
    pub fn classify(self) -> Result<ServerTrigger, FrameError> {
        let new_cloudlet = self.new_cloudlet.and_then(usable_cloudlet);
        let trigger = match self.event_type.as_str() {
            EVENT_INIT_CONNECTION => ServerTrigger::InitConnection,
            EVENT_APPINST_HEALTH => ServerTrigger::HealthChanged {
                status: self.health_check.unwrap_or_default(),
                new_cloudlet,
            },
            EVENT_CLOUDLET_MAINTENANCE => ServerTrigger::MaintenanceChanged {
                state: self.maintenance_state.unwrap_or_default(),
                new_cloudlet,
            },
            EVENT_CLOUDLET_STATE => ServerTrigger::CloudletStateChanged {
                state: self.cloudlet_state.unwrap_or_default(),
                new_cloudlet,
            },
            EVENT_LATENCY_REQUEST => ServerTrigger::LatencyRequest,
            EVENT_LATENCY_PROCESSED => ServerTrigger::LatencyProcessed(
                self.statistics.ok_or(FrameError::MissingField { event: EVENT_LATENCY_PROCESSED, field: "statistics" })?,
            ),
            EVENT_CLOUDLET_UPDATE => ServerTrigger::CloudletUpdate(new_cloudlet),
            EVENT_ERROR => ServerTrigger::Error(self.error_msg.unwrap_or_else(|| "unspecified server error".into())),
            other => return Err(FrameError::UnknownEvent(other.to_string())),
        };
        Ok(trigger)
    }
}

// A replacement only counts when the directory actually found one.
fn usable_cloudlet(reply: FindCloudletReply) -> Option<CloudletDescriptor> {
    (reply.status == DirectoryStatus::Success && !reply.fqdn.is_empty()).then(|| reply.into_descriptor())
}

/// Decode and classify one inbound frame.
pub fn decode_server_frame(frame: &[u8]) -> Result<ServerTrigger, FrameError> {
    let event: ServerEdgeEvent = serde_json::from_slice(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
    event.classify()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown server event type {0}")]
    UnknownEvent(String),
    #[error("{event} frame without {field}")]
    MissingField { event: &'static str, field: &'static str },
}

/// Server-originated signal, one per inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerTrigger {
    InitConnection,
    HealthChanged { status: String, new_cloudlet: Option<CloudletDescriptor> },
    MaintenanceChanged { state: String, new_cloudlet: Option<CloudletDescriptor> },
    CloudletStateChanged { state: String, new_cloudlet: Option<CloudletDescriptor> },
    LatencyRequest,
    LatencyProcessed(LatencyStats),
    CloudletUpdate(Option<CloudletDescriptor>),
    Error(String),
}

impl ServerTrigger {
    /// Enabled-trigger entry this signal is gated by, if any.
    pub fn find_cloudlet_trigger(&self) -> Option<FindCloudletEventTrigger> {
        match self {
            ServerTrigger::HealthChanged { .. } => Some(FindCloudletEventTrigger::AppInstHealthChanged),
            ServerTrigger::MaintenanceChanged { .. } => Some(FindCloudletEventTrigger::CloudletMaintenanceStateChanged),
            ServerTrigger::CloudletStateChanged { .. } => Some(FindCloudletEventTrigger::CloudletStateChanged),
            ServerTrigger::LatencyProcessed(_) => Some(FindCloudletEventTrigger::LatencyTooHigh),
            ServerTrigger::CloudletUpdate(_) => Some(FindCloudletEventTrigger::CloserCloudlet),
            ServerTrigger::Error(_) => Some(FindCloudletEventTrigger::Error),
            ServerTrigger::InitConnection | ServerTrigger::LatencyRequest => None,
        }
    }

    /// Replacement cloudlet carried directly by the signal.
    pub fn new_cloudlet(&self) -> Option<&CloudletDescriptor> {
        match self {
            ServerTrigger::HealthChanged { new_cloudlet, .. }
            | ServerTrigger::MaintenanceChanged { new_cloudlet, .. }
            | ServerTrigger::CloudletStateChanged { new_cloudlet, .. }
            | ServerTrigger::CloudletUpdate(new_cloudlet) => new_cloudlet.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerTrigger::InitConnection => EVENT_INIT_CONNECTION,
            ServerTrigger::HealthChanged { .. } => EVENT_APPINST_HEALTH,
            ServerTrigger::MaintenanceChanged { .. } => EVENT_CLOUDLET_MAINTENANCE,
            ServerTrigger::CloudletStateChanged { .. } => EVENT_CLOUDLET_STATE,
            ServerTrigger::LatencyRequest => EVENT_LATENCY_REQUEST,
            ServerTrigger::LatencyProcessed(_) => EVENT_LATENCY_PROCESSED,
            ServerTrigger::CloudletUpdate(_) => EVENT_CLOUDLET_UPDATE,
            ServerTrigger::Error(_) => EVENT_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_shape() {
        let cookies = SessionCookies { session_cookie: "abc123".into(), edge_events_cookie: "ee-1".into() };
        let frame = ClientEdgeEvent::location_update(&cookies, Location::new(37.33, -121.88), DeviceInfoDynamic::default());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event_type"], "EVENT_LOCATION_UPDATE");
        assert_eq!(value["edge_events_cookie"], "ee-1");
        assert!(value.get("samples").is_none());
        assert!(frame.is_telemetry());
        assert!(!ClientEdgeEvent::terminate_connection(&cookies).is_telemetry());
    }

    #[test]
    fn test_classify_health_with_replacement() {
        let frame = json!({
            "event_type": "EVENT_APPINST_HEALTH",
            "health_check": "HEALTH_CHECK_FAIL_ROOTLB_OFFLINE",
            "new_cloudlet": {"status": "FIND_FOUND", "fqdn": "edge2.example.net", "edge_events_cookie": "ee-2"}
        });
        let trigger = decode_server_frame(frame.to_string().as_bytes()).unwrap();
        assert_eq!(trigger.find_cloudlet_trigger(), Some(FindCloudletEventTrigger::AppInstHealthChanged));
        assert_eq!(trigger.new_cloudlet().unwrap().fqdn, "edge2.example.net");
    }

    #[test]
    fn test_classify_not_found_replacement_is_dropped() {
        let frame = json!({
            "event_type": "EVENT_CLOUDLET_STATE",
            "cloudlet_state": "CLOUDLET_STATE_OFFLINE",
            "new_cloudlet": {"status": "FIND_NOTFOUND"}
        });
        let trigger = decode_server_frame(frame.to_string().as_bytes()).unwrap();
        assert!(trigger.new_cloudlet().is_none());
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        let unknown = json!({"event_type": "EVENT_SOMETHING_NEW"}).to_string();
        assert_eq!(
            decode_server_frame(unknown.as_bytes()),
            Err(FrameError::UnknownEvent("EVENT_SOMETHING_NEW".into()))
        );
        assert!(matches!(decode_server_frame(b"not json"), Err(FrameError::Malformed(_))));

        let no_stats = json!({"event_type": "EVENT_LATENCY_PROCESSED"}).to_string();
        assert!(matches!(decode_server_frame(no_stats.as_bytes()), Err(FrameError::MissingField { .. })));
    }
}
