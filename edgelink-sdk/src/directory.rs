//! Directory service ("DME") protocol
//!
//! REST/JSON API consumed by the resolver:
//! - `POST /v1/registerclient`  → session cookie
//! - `POST /v1/findcloudlet`    → nearest cloudlet + edge-events cookie
//! - `POST /v1/getappinstlist`  → candidate cloudlets for performance mode

use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::models::{AppPort, CloudletDescriptor, Location};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Closed status set; anything but `Success` is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryStatus {
    #[serde(rename = "SUCCESS", alias = "RS_SUCCESS", alias = "FIND_FOUND", alias = "AI_SUCCESS")]
    Success,
    #[serde(rename = "NOT_FOUND", alias = "FIND_NOTFOUND")]
    NotFound,
    #[serde(rename = "ERROR", alias = "RS_FAIL", alias = "AI_FAIL")]
    Error,
    /// Also catches codes this client does not know; must stay last.
    #[serde(
        rename = "UNKNOWN",
        alias = "RS_UNDEFINED",
        alias = "FIND_UNKNOWN",
        alias = "AI_UNDEFINED",
        other
    )]
    Unknown,
}

/// Resolved directory host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEndpoint {
    pub host: String,
    pub port: u16,
}

impl DirectoryEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for DirectoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterClientRequest {
    pub ver: u32,
    pub org_name: String,
    pub app_name: String,
    pub app_vers: String,
    #[serde(default)]
    pub carrier_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterClientReply {
    pub status: DirectoryStatus,
    #[serde(default)]
    pub session_cookie: String,
    #[serde(default)]
    pub token_server_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindCloudletRequest {
    pub ver: u32,
    pub session_cookie: String,
    #[serde(default)]
    pub carrier_name: String,
    pub gps_location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindCloudletReply {
    pub status: DirectoryStatus,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub ports: Vec<AppPort>,
    #[serde(default)]
    pub cloudlet_location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudlet_name: Option<String>,
    #[serde(default)]
    pub edge_events_cookie: String,
}

impl FindCloudletReply {
    pub fn into_descriptor(self) -> CloudletDescriptor {
        CloudletDescriptor {
            fqdn: self.fqdn,
            cloudlet_name: self.cloudlet_name,
            ports: self.ports,
            location: self.cloudlet_location.unwrap_or_else(|| Location::new(0.0, 0.0)),
            edge_events_cookie: Some(self.edge_events_cookie).filter(|c| !c.is_empty()),
            resolved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstListRequest {
    pub ver: u32,
    pub session_cookie: String,
    #[serde(default)]
    pub carrier_name: String,
    pub gps_location: Location,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstance {
    pub app_name: String,
    pub app_vers: String,
    pub fqdn: String,
    #[serde(default)]
    pub ports: Vec<AppPort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudletLocation {
    pub cloudlet_name: String,
    pub gps_location: Location,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub appinstances: Vec<AppInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstListReply {
    pub status: DirectoryStatus,
    #[serde(default)]
    pub cloudlets: Vec<CloudletLocation>,
}

impl AppInstListReply {
    /// One descriptor per application instance, in directory order.
    pub fn descriptors(&self) -> Vec<CloudletDescriptor> {
        self.cloudlets
            .iter()
            .flat_map(|cloudlet| {
                cloudlet.appinstances.iter().map(move |inst| CloudletDescriptor {
                    fqdn: inst.fqdn.clone(),
                    cloudlet_name: Some(cloudlet.cloudlet_name.clone()),
                    ports: inst.ports.clone(),
                    location: cloudlet.gps_location.clone(),
                    edge_events_cookie: None,
                    resolved_at: Utc::now(),
                })
            })
            .collect()
    }
}

/// Transport to the directory service
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn register_client(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &RegisterClientRequest,
    ) -> Result<RegisterClientReply, DirectoryError>;

    async fn find_cloudlet(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &FindCloudletRequest,
    ) -> Result<FindCloudletReply, DirectoryError>;

    async fn get_app_inst_list(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &AppInstListRequest,
    ) -> Result<AppInstListReply, DirectoryError>;
}

/// REST client backed by reqwest
#[derive(Clone)]
pub struct HttpDirectoryClient {
    http: reqwest::Client,
    use_tls: bool,
}

impl HttpDirectoryClient {
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("edgelink-sdk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DirectoryError::Decode(format!("http client setup: {e}")))?;
        Ok(Self { http, use_tls: config.use_tls })
    }

    fn url(&self, endpoint: &DirectoryEndpoint, path: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}{path}", endpoint.host, endpoint.port)
    }

    async fn post<Req, Rep>(&self, endpoint: &DirectoryEndpoint, path: &str, body: &Req) -> Result<Rep, DirectoryError>
    where
        Req: Serialize + Sync,
        Rep: DeserializeOwned,
    {
        let url = self.url(endpoint, path);
        debug!("POST {}", url);

        let response = self.http.post(&url).json(body).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                DirectoryError::Unreachable { host: endpoint.host.clone(), reason: e.to_string() }
            } else {
                DirectoryError::Decode(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Http { status: status.as_u16(), body });
        }

        response.json::<Rep>().await.map_err(|e| DirectoryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn register_client(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &RegisterClientRequest,
    ) -> Result<RegisterClientReply, DirectoryError> {
        self.post(endpoint, "/v1/registerclient", request).await
    }

    async fn find_cloudlet(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &FindCloudletRequest,
    ) -> Result<FindCloudletReply, DirectoryError> {
        self.post(endpoint, "/v1/findcloudlet", request).await
    }

    async fn get_app_inst_list(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &AppInstListRequest,
    ) -> Result<AppInstListReply, DirectoryError> {
        self.post(endpoint, "/v1/getappinstlist", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_codes() {
        let parse = |s: &str| serde_json::from_str::<DirectoryStatus>(&format!("\"{s}\"")).unwrap();
        assert_eq!(parse("RS_SUCCESS"), DirectoryStatus::Success);
        assert_eq!(parse("FIND_FOUND"), DirectoryStatus::Success);
        assert_eq!(parse("FIND_NOTFOUND"), DirectoryStatus::NotFound);
        assert_eq!(parse("RS_FAIL"), DirectoryStatus::Error);
        assert_eq!(parse("FIND_UNKNOWN"), DirectoryStatus::Unknown);
        assert_eq!(parse("SOMETHING_NEW"), DirectoryStatus::Unknown);
    }

    #[test]
    fn test_unrecognised_find_status_is_unknown() {
        let reply: FindCloudletReply = serde_json::from_value(serde_json::json!({
            "status": "FIND_WHATEVER",
            "fqdn": "edge1.example.net",
            "edge_events_cookie": "ee-1"
        }))
        .unwrap();
        assert_eq!(reply.status, DirectoryStatus::Unknown);
        assert_ne!(reply.status, DirectoryStatus::Success);
    }

    #[test]
    fn test_find_cloudlet_reply_descriptor() {
        let reply: FindCloudletReply = serde_json::from_value(serde_json::json!({
            "status": "FIND_FOUND",
            "fqdn": "edge1.example.net",
            "ports": [{"proto": "L_PROTO_TCP", "public_port": 8008}],
            "cloudlet_location": {"latitude": 37.33, "longitude": -121.88},
            "edge_events_cookie": "ee-1"
        }))
        .unwrap();

        let descriptor = reply.into_descriptor();
        assert_eq!(descriptor.fqdn, "edge1.example.net");
        assert_eq!(descriptor.ports[0].public_port, 8008);
        assert_eq!(descriptor.edge_events_cookie.as_deref(), Some("ee-1"));
    }

    #[test]
    fn test_app_inst_list_flattening() {
        let reply = AppInstListReply {
            status: DirectoryStatus::Success,
            cloudlets: vec![
                CloudletLocation {
                    cloudlet_name: "sj".into(),
                    gps_location: Location::new(37.3, -121.9),
                    distance: 1.0,
                    appinstances: vec![AppInstance {
                        app_name: "Game".into(),
                        app_vers: "1.0".into(),
                        fqdn: "sj.example.net".into(),
                        ports: vec![AppPort::tcp(8008)],
                    }],
                },
                CloudletLocation {
                    cloudlet_name: "empty".into(),
                    gps_location: Location::new(1.0, 1.0),
                    distance: 9.0,
                    appinstances: vec![],
                },
            ],
        };
        let descriptors = reply.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].cloudlet_name.as_deref(), Some("sj"));
    }
}
