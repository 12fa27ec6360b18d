//! Session registry: single source of truth for the session
//!
//! Holds the registered identity, both cookies, the directory endpoint that
//! answered, the current cloudlet and, transiently, one candidate cloudlet.
//! All fields live under one lock so a migration swaps cloudlet and cookie
//! together and readers never see a half-migrated session.

use crate::directory::DirectoryEndpoint;
use crate::error::SetupError;
use crate::models::{ClientIdentity, CloudletDescriptor};
use crate::state::{new_state, Shared};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct SessionState {
    identity: Option<ClientIdentity>,
    session_cookie: Option<String>,
    edge_events_cookie: Option<String>,
    directory: Option<DirectoryEndpoint>,
    current: Option<Arc<CloudletDescriptor>>,
    candidate: Option<Arc<CloudletDescriptor>>,
}

/// Both cookies, as required to open the edge-events stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookies {
    pub session_cookie: String,
    pub edge_events_cookie: String,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    state: Shared<SessionState>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { state: new_state(SessionState::default()) }
    }

    /// Record a successful registration. A new registration starts a new
    /// session: any previous cloudlet and edge-events cookie are dropped.
    pub fn record_registration(&self, identity: ClientIdentity, session_cookie: String, directory: DirectoryEndpoint) {
        let mut state = self.state.lock();
        info!("registered {}/{} v{} via {}", identity.org_name, identity.app_name, identity.app_vers, directory);
        *state = SessionState {
            identity: Some(identity),
            session_cookie: Some(session_cookie),
            edge_events_cookie: None,
            directory: Some(directory),
            current: None,
            candidate: None,
        };
    }

    /// Record the cloudlet returned by a proximity/performance FindCloudlet.
    pub fn record_cloudlet(&self, cloudlet: CloudletDescriptor) -> Arc<CloudletDescriptor> {
        let cloudlet = Arc::new(cloudlet);
        let mut state = self.state.lock();
        if let Some(cookie) = non_empty(&cloudlet.edge_events_cookie) {
            state.edge_events_cookie = Some(cookie);
        }
        debug!("current cloudlet is now {}", cloudlet.fqdn);
        state.current = Some(cloudlet.clone());
        state.candidate = None;
        cloudlet
    }

    pub fn identity(&self) -> Option<ClientIdentity> {
        self.state.lock().identity.clone()
    }

    pub fn session_cookie(&self) -> Option<String> {
        non_empty(&self.state.lock().session_cookie)
    }

    pub fn edge_events_cookie(&self) -> Option<String> {
        non_empty(&self.state.lock().edge_events_cookie)
    }

    pub fn directory_endpoint(&self) -> Option<DirectoryEndpoint> {
        self.state.lock().directory.clone()
    }

    pub fn set_directory_endpoint(&self, endpoint: DirectoryEndpoint) {
        self.state.lock().directory = Some(endpoint);
    }

    pub fn current_cloudlet(&self) -> Option<Arc<CloudletDescriptor>> {
        self.state.lock().current.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.session_cookie().is_some()
    }

    /// Both cookies, or the setup error naming the missing one.
    pub fn cookies(&self) -> Result<SessionCookies, SetupError> {
        let state = self.state.lock();
        let session_cookie = non_empty(&state.session_cookie).ok_or(SetupError::MissingCookie("session cookie"))?;
        let edge_events_cookie =
            non_empty(&state.edge_events_cookie).ok_or(SetupError::MissingCookie("edge events cookie"))?;
        Ok(SessionCookies { session_cookie, edge_events_cookie })
    }

    pub fn candidate(&self) -> Option<Arc<CloudletDescriptor>> {
        self.state.lock().candidate.clone()
    }

    /// Park a candidate under evaluation (at most one).
    pub fn set_candidate(&self, candidate: CloudletDescriptor) -> Arc<CloudletDescriptor> {
        let candidate = Arc::new(candidate);
        self.state.lock().candidate = Some(candidate.clone());
        candidate
    }

    /// Make `candidate` the current cloudlet. Its edge-events cookie replaces
    /// the old one; without one the existing cookie is carried over.
    pub fn promote(&self, candidate: Arc<CloudletDescriptor>) {
        let mut state = self.state.lock();
        if let Some(cookie) = non_empty(&candidate.edge_events_cookie) {
            state.edge_events_cookie = Some(cookie);
        }
        info!(
            "session migrated {} -> {}",
            state.current.as_ref().map(|c| c.fqdn.as_str()).unwrap_or("<none>"),
            candidate.fqdn
        );
        state.current = Some(candidate);
        state.candidate = None;
    }

    /// Invalidate both cookies (explicit stop).
    pub fn clear_cookies(&self) {
        let mut state = self.state.lock();
        state.session_cookie = None;
        state.edge_events_cookie = None;
        state.candidate = None;
        debug!("session cookies cleared");
    }
}
