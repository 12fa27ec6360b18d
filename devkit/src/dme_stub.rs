/*!
Mock directory service

Scriptable `DirectoryClient`: canned replies, unreachable hosts, a call log
for assertions and an optional gate that holds `get_app_inst_list` until
the test releases it.
*/

use async_trait::async_trait;
use edgelink_sdk::directory::{
    AppInstListReply, AppInstListRequest, AppInstance, CloudletLocation, DirectoryClient, DirectoryEndpoint,
    DirectoryStatus, FindCloudletReply, FindCloudletRequest, RegisterClientReply, RegisterClientRequest,
};
use edgelink_sdk::error::DirectoryError;
use edgelink_sdk::models::{AppPort, Location};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryCall {
    pub op: &'static str,
    pub host: String,
}

pub struct MockDirectory {
    register_reply: Mutex<RegisterClientReply>,
    find_reply: Mutex<FindCloudletReply>,
    app_insts: Mutex<AppInstListReply>,
    down_hosts: Mutex<Vec<String>>,
    calls: Mutex<Vec<DirectoryCall>>,
    list_gate: Mutex<Option<Arc<Notify>>>,
    last_register: Mutex<Option<RegisterClientRequest>>,
}

impl MockDirectory {
    /// Directory that registers `Acme/Game` with cookie `abc123` and finds
    /// `edge1.example.net:8008`.
    pub fn new() -> Self {
        Self {
            register_reply: Mutex::new(RegisterClientReply {
                status: DirectoryStatus::Success,
                session_cookie: "abc123".into(),
                token_server_uri: String::new(),
            }),
            find_reply: Mutex::new(FindCloudletReply {
                status: DirectoryStatus::Success,
                fqdn: "edge1.example.net".into(),
                ports: vec![AppPort::tcp(8008)],
                cloudlet_location: Some(Location::new(37.33, -121.88)),
                cloudlet_name: Some("sanjose".into()),
                edge_events_cookie: "ee-1".into(),
            }),
            app_insts: Mutex::new(app_inst_reply(&[("sanjose", "edge1.example.net"), ("paloalto", "edge2.example.net")])),
            down_hosts: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            list_gate: Mutex::new(None),
            last_register: Mutex::new(None),
        }
    }

    pub fn set_register_reply(&self, reply: RegisterClientReply) {
        *self.register_reply.lock() = reply;
    }

    pub fn set_find_reply(&self, reply: FindCloudletReply) {
        *self.find_reply.lock() = reply;
    }

    /// Candidates returned in performance mode, as `(cloudlet, fqdn)` pairs.
    pub fn set_app_instances(&self, instances: &[(&str, &str)]) {
        *self.app_insts.lock() = app_inst_reply(instances);
    }

    pub fn take_down(&self, host: &str) {
        self.down_hosts.lock().push(host.to_string());
    }

    /// Hold every `get_app_inst_list` until the returned gate is notified.
    pub fn gate_app_inst_list(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<DirectoryCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn last_register_request(&self) -> Option<RegisterClientRequest> {
        self.last_register.lock().clone()
    }

    fn record(&self, op: &'static str, endpoint: &DirectoryEndpoint) -> Result<(), DirectoryError> {
        self.calls.lock().push(DirectoryCall { op, host: endpoint.host.clone() });
        if self.down_hosts.lock().contains(&endpoint.host) {
            log::warn!("🚫 [MOCK] {} unreachable for {}", endpoint.host, op);
            return Err(DirectoryError::Unreachable { host: endpoint.host.clone(), reason: "connection refused".into() });
        }
        log::info!("📇 [MOCK] {} via {}", op, endpoint);
        Ok(())
    }
}

impl Default for MockDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn app_inst_reply(instances: &[(&str, &str)]) -> AppInstListReply {
    AppInstListReply {
        status: DirectoryStatus::Success,
        cloudlets: instances
            .iter()
            .map(|(cloudlet, fqdn)| CloudletLocation {
                cloudlet_name: cloudlet.to_string(),
                gps_location: Location::new(37.4, -122.0),
                distance: 0.0,
                appinstances: vec![AppInstance {
                    app_name: "Game".into(),
                    app_vers: "1.0".into(),
                    fqdn: fqdn.to_string(),
                    ports: vec![AppPort::tcp(8008)],
                }],
            })
            .collect(),
    }
}

#[async_trait]
impl DirectoryClient for MockDirectory {
    async fn register_client(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &RegisterClientRequest,
    ) -> Result<RegisterClientReply, DirectoryError> {
        self.record("register", endpoint)?;
        *self.last_register.lock() = Some(request.clone());
        Ok(self.register_reply.lock().clone())
    }

    async fn find_cloudlet(
        &self,
        endpoint: &DirectoryEndpoint,
        _request: &FindCloudletRequest,
    ) -> Result<FindCloudletReply, DirectoryError> {
        self.record("find_cloudlet", endpoint)?;
        Ok(self.find_reply.lock().clone())
    }

    async fn get_app_inst_list(
        &self,
        endpoint: &DirectoryEndpoint,
        _request: &AppInstListRequest,
    ) -> Result<AppInstListReply, DirectoryError> {
        self.record("get_app_inst_list", endpoint)?;
        let gate = self.list_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.app_insts.lock().clone())
    }
}
