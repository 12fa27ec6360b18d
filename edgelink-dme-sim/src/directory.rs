//! In-memory directory service
//!
//! Sessions are keyed by session cookie; every FindCloudlet hands out a new
//! edge-events cookie bound to the session and the chosen cloudlet.
//! Cloudlets taken offline are skipped by every lookup.

use crate::config::{AppConf, CloudletConf, SimConfig};
use edgelink_sdk::directory::{
    AppInstListReply, AppInstListRequest, AppInstance, CloudletLocation, DirectoryStatus, FindCloudletReply,
    FindCloudletRequest, RegisterClientReply, RegisterClientRequest,
};
use edgelink_sdk::models::{AppPort, Location};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Session {
    app: AppConf,
}

/// Edge-events connection a client may open
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSession {
    pub session_cookie: String,
    pub cloudlet: String,
}

pub struct Directory {
    config: SimConfig,
    sessions: HashMap<String, Session>,
    edge_sessions: HashMap<String, EdgeSession>,
    offline: HashSet<String>,
}

fn find_failure(status: DirectoryStatus) -> FindCloudletReply {
    FindCloudletReply {
        status,
        fqdn: String::new(),
        ports: Vec::new(),
        cloudlet_location: None,
        cloudlet_name: None,
        edge_events_cookie: String::new(),
    }
}

fn cloudlet_location(cloudlet: &CloudletConf) -> Location {
    Location::new(cloudlet.latitude, cloudlet.longitude)
}

fn cloudlet_ports(cloudlet: &CloudletConf) -> Vec<AppPort> {
    cloudlet.ports.iter().copied().map(AppPort::tcp).collect()
}

impl Directory {
    pub fn new(config: SimConfig) -> Self {
        Self { config, sessions: HashMap::new(), edge_sessions: HashMap::new(), offline: HashSet::new() }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn edge_session_count(&self) -> usize {
        self.edge_sessions.len()
    }

    pub fn edge_session(&self, cookie: &str) -> Option<&EdgeSession> {
        self.edge_sessions.get(cookie)
    }

    pub fn register(&mut self, request: &RegisterClientRequest) -> RegisterClientReply {
        let app = AppConf {
            org_name: request.org_name.clone(),
            app_name: request.app_name.clone(),
            app_vers: request.app_vers.clone(),
        };
        if !self.config.apps.is_empty() && !self.config.apps.contains(&app) {
            warn!("register rejected for unknown app {}/{} v{}", app.org_name, app.app_name, app.app_vers);
            return RegisterClientReply {
                status: DirectoryStatus::Error,
                session_cookie: String::new(),
                token_server_uri: String::new(),
            };
        }

        let cookie = uuid::Uuid::new_v4().to_string();
        info!("registered {}/{} v{} ({})", app.org_name, app.app_name, app.app_vers, request.carrier_name);
        self.sessions.insert(cookie.clone(), Session { app });
        RegisterClientReply { status: DirectoryStatus::Success, session_cookie: cookie, token_server_uri: String::new() }
    }

    /// Online cloudlets, nearest first
    fn by_distance(&self, location: &Location) -> Vec<(&CloudletConf, f64)> {
        let mut cloudlets: Vec<_> = self
            .config
            .cloudlets
            .iter()
            .filter(|c| !self.offline.contains(&c.name))
            .map(|c| (c, location.distance_km(&cloudlet_location(c))))
            .collect();
        cloudlets.sort_by(|(_, a), (_, b)| a.total_cmp(b));
        cloudlets
    }

    fn bind(&mut self, session_cookie: &str, cloudlet: &CloudletConf) -> FindCloudletReply {
        let edge_cookie = uuid::Uuid::new_v4().to_string();
        self.edge_sessions.insert(
            edge_cookie.clone(),
            EdgeSession { session_cookie: session_cookie.to_string(), cloudlet: cloudlet.name.clone() },
        );
        FindCloudletReply {
            status: DirectoryStatus::Success,
            fqdn: cloudlet.fqdn.clone(),
            ports: cloudlet_ports(cloudlet),
            cloudlet_location: Some(cloudlet_location(cloudlet)),
            cloudlet_name: Some(cloudlet.name.clone()),
            edge_events_cookie: edge_cookie,
        }
    }

    pub fn find_cloudlet(&mut self, request: &FindCloudletRequest) -> FindCloudletReply {
        if !self.sessions.contains_key(&request.session_cookie) {
            warn!("find cloudlet with unknown session cookie");
            return find_failure(DirectoryStatus::Error);
        }
        let Some(nearest) = self.by_distance(&request.gps_location).first().map(|(c, _)| (*c).clone()) else {
            return find_failure(DirectoryStatus::NotFound);
        };
        debug!("nearest cloudlet for session is {}", nearest.name);
        self.bind(&request.session_cookie, &nearest)
    }

    pub fn get_app_inst_list(&self, request: &AppInstListRequest) -> AppInstListReply {
        let Some(session) = self.sessions.get(&request.session_cookie) else {
            return AppInstListReply { status: DirectoryStatus::Error, cloudlets: Vec::new() };
        };
        let limit = if request.limit == 0 { usize::MAX } else { request.limit as usize };
        let cloudlets = self
            .by_distance(&request.gps_location)
            .into_iter()
            .take(limit)
            .map(|(cloudlet, distance)| CloudletLocation {
                cloudlet_name: cloudlet.name.clone(),
                gps_location: cloudlet_location(cloudlet),
                distance,
                appinstances: vec![AppInstance {
                    app_name: session.app.app_name.clone(),
                    app_vers: session.app.app_vers.clone(),
                    fqdn: cloudlet.fqdn.clone(),
                    ports: cloudlet_ports(cloudlet),
                }],
            })
            .collect();
        AppInstListReply { status: DirectoryStatus::Success, cloudlets }
    }

    /// Nearest cloudlet for an edge session, when it is not the one it uses.
    pub fn closer_cloudlet(&mut self, edge_cookie: &str, location: &Location) -> Option<FindCloudletReply> {
        let session = self.edge_sessions.get(edge_cookie)?.clone();
        let nearest = self.by_distance(location).first().map(|(c, _)| (*c).clone())?;
        if nearest.name == session.cloudlet {
            return None;
        }
        info!("closer cloudlet {} for session on {}", nearest.name, session.cloudlet);
        Some(self.bind(&session.session_cookie, &nearest))
    }

    pub fn end_edge_session(&mut self, edge_cookie: &str) {
        if self.edge_sessions.remove(edge_cookie).is_some() {
            debug!("edge session ended");
        }
    }

    /// Take a cloudlet offline. Returns each affected edge cookie with its
    /// replacement, if any cloudlet is left.
    pub fn take_offline(&mut self, name: &str) -> Vec<(String, Option<FindCloudletReply>)> {
        self.offline.insert(name.to_string());
        let affected: Vec<(String, EdgeSession)> = self
            .edge_sessions
            .iter()
            .filter(|(_, s)| s.cloudlet == name)
            .map(|(cookie, s)| (cookie.clone(), s.clone()))
            .collect();

        affected
            .into_iter()
            .map(|(cookie, session)| {
                let origin = self
                    .config
                    .cloudlets
                    .iter()
                    .find(|c| c.name == session.cloudlet)
                    .map(cloudlet_location)
                    .unwrap_or_else(|| Location::new(0.0, 0.0));
                let replacement = self.by_distance(&origin).first().map(|(c, _)| (*c).clone());
                let reply = replacement.map(|c| self.bind(&session.session_cookie, &c));
                (cookie, reply)
            })
            .collect()
    }

    pub fn bring_online(&mut self, name: &str) {
        self.offline.remove(name);
    }

    pub fn knows_cloudlet(&self, name: &str) -> bool {
        self.config.cloudlets.iter().any(|c| c.name == name)
    }
}
