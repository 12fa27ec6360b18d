//! Cloudlet resolution against the directory service
//!
//! - Register: identity → session cookie
//! - FindCloudlet (proximity): directory's GPS-nearest pick
//! - FindCloudlet (performance): every app instance in the region is probed
//!   concurrently and the lowest average latency wins
//!
//! Directory host selection: an explicit host is used as-is. Otherwise the
//! carrier host is derived from MCC-MNC, and a transient transport failure
//! is retried once against the wifi host.

use crate::config::DirectoryConfig;
use crate::device::{location_or_default, DeviceInfoProvider, LocationProvider};
use crate::directory::{
    AppInstListRequest, DirectoryClient, DirectoryEndpoint, DirectoryStatus, FindCloudletReply,
    FindCloudletRequest, RegisterClientRequest,
};
use crate::error::{DirectoryError, FindCloudletFailure, RegisterFailure, ResolverError};
use crate::models::{ClientIdentity, CloudletDescriptor, FindCloudletMode, LatencyStats, Location};
use crate::probe::LatencyTester;
use crate::registry::SessionRegistry;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const API_VERSION: u32 = 1;

/// Register → FindCloudlet workflow bound to one session registry
pub struct CloudletResolver {
    directory: Arc<dyn DirectoryClient>,
    config: DirectoryConfig,
    registry: SessionRegistry,
    location: Arc<dyn LocationProvider>,
    device: Arc<dyn DeviceInfoProvider>,
    tester: LatencyTester,
    default_location: Location,
    latency_test_port: u16,
    // Set when the host named the directory explicitly; disables fallback
    pinned: AtomicBool,
}

impl CloudletResolver {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        config: DirectoryConfig,
        registry: SessionRegistry,
        location: Arc<dyn LocationProvider>,
        device: Arc<dyn DeviceInfoProvider>,
        tester: LatencyTester,
    ) -> Self {
        Self {
            directory,
            config,
            registry,
            location,
            device,
            tester,
            default_location: Location::new(37.3382, -121.8863),
            latency_test_port: 0,
            pinned: AtomicBool::new(false),
        }
    }

    pub fn with_default_location(mut self, location: Location) -> Self {
        self.default_location = location;
        self
    }

    pub fn with_latency_test_port(mut self, port: u16) -> Self {
        self.latency_test_port = port;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn tester(&self) -> &LatencyTester {
        &self.tester
    }

    fn wifi_endpoint(&self) -> DirectoryEndpoint {
        DirectoryEndpoint::new(self.config.wifi_host(), self.config.port)
    }

    /// Primary endpoint for registration plus the fallback, if any.
    fn registration_route(&self, dme_host: Option<&str>, dme_port: Option<u16>) -> (DirectoryEndpoint, Option<DirectoryEndpoint>) {
        let port = dme_port.unwrap_or(self.config.port);
        if let Some(host) = dme_host.filter(|h| !h.is_empty()) {
            return (DirectoryEndpoint::new(host, port), None);
        }

        let wifi = DirectoryEndpoint::new(self.config.wifi_host(), port);
        match self.device.mcc_mnc() {
            Some(mcc_mnc) if !mcc_mnc.is_empty() => {
                (DirectoryEndpoint::new(self.config.carrier_host(&mcc_mnc), port), Some(wifi))
            }
            _ => {
                debug!("no MCC-MNC available, using wifi directory host");
                (wifi, None)
            }
        }
    }

    /// Endpoint for calls after registration.
    fn session_route(&self) -> (DirectoryEndpoint, Option<DirectoryEndpoint>) {
        let wifi = self.wifi_endpoint();
        match self.registry.directory_endpoint() {
            Some(endpoint) if self.pinned.load(Ordering::SeqCst) => (endpoint, None),
            Some(endpoint) if endpoint.host != wifi.host => (endpoint, Some(wifi)),
            Some(endpoint) => (endpoint, None),
            None => (wifi, None),
        }
    }

    async fn with_fallback<T, F, Fut>(
        &self,
        primary: DirectoryEndpoint,
        fallback: Option<DirectoryEndpoint>,
        call: F,
    ) -> Result<(T, DirectoryEndpoint), DirectoryError>
    where
        F: Fn(DirectoryEndpoint) -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        match call(primary.clone()).await {
            Ok(reply) => Ok((reply, primary)),
            Err(e) if e.is_transient() => match fallback {
                Some(wifi) => {
                    warn!("directory {} unreachable ({}), retrying on {}", primary, e, wifi);
                    let reply = call(wifi.clone()).await?;
                    Ok((reply, wifi))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Register the application and store the session cookie.
    pub async fn register(
        &self,
        identity: ClientIdentity,
        dme_host: Option<&str>,
        dme_port: Option<u16>,
    ) -> Result<String, RegisterFailure> {
        let (primary, fallback) = self.registration_route(dme_host, dme_port);
        let request = RegisterClientRequest {
            ver: API_VERSION,
            org_name: identity.org_name.clone(),
            app_name: identity.app_name.clone(),
            app_vers: identity.app_vers.clone(),
            carrier_name: self.device.device_info_dynamic().carrier_name,
            auth_token: identity.auth_token.clone(),
            unique_id_type: identity.unique_id_type.clone(),
            unique_id: identity.unique_id.clone(),
        };

        let (directory, request) = (&self.directory, &request);
        let (reply, endpoint) = self
            .with_fallback(primary, fallback, move |endpoint| async move { directory.register_client(&endpoint, request).await })
            .await
            .map_err(|e| {
                warn!("register failed: {}", e);
                RegisterFailure::Transport(e)
            })?;

        if reply.status != DirectoryStatus::Success {
            warn!("register rejected by {}: {:?}", endpoint, reply.status);
            return Err(RegisterFailure::Rejected(reply.status));
        }
        if reply.session_cookie.is_empty() {
            return Err(RegisterFailure::MissingCookie);
        }

        self.pinned.store(dme_host.is_some_and(|h| !h.is_empty()), Ordering::SeqCst);
        self.registry.record_registration(identity, reply.session_cookie.clone(), endpoint);
        Ok(reply.session_cookie)
    }

    async fn proximity_reply(&self, session_cookie: &str, location: &Location) -> Result<FindCloudletReply, FindCloudletFailure> {
        let request = FindCloudletRequest {
            ver: API_VERSION,
            session_cookie: session_cookie.to_string(),
            carrier_name: self.device.device_info_dynamic().carrier_name,
            gps_location: location.clone(),
        };

        let (primary, fallback) = self.session_route();
        let (directory, request) = (&self.directory, &request);
        let (reply, endpoint) = self
            .with_fallback(primary, fallback, move |endpoint| async move { directory.find_cloudlet(&endpoint, request).await })
            .await
            .map_err(FindCloudletFailure::Transport)?;
        self.registry.set_directory_endpoint(endpoint);

        match reply.status {
            DirectoryStatus::Success if !reply.fqdn.is_empty() => Ok(reply),
            DirectoryStatus::Success | DirectoryStatus::NotFound => Err(FindCloudletFailure::NotFound),
            other => Err(FindCloudletFailure::UnknownStatus(other)),
        }
    }

    /// Probe every app instance in the region; lowest average wins.
    async fn performance_pick(
        &self,
        session_cookie: &str,
        location: &Location,
    ) -> Result<(CloudletDescriptor, LatencyStats), FindCloudletFailure> {
        let request = AppInstListRequest {
            ver: API_VERSION,
            session_cookie: session_cookie.to_string(),
            carrier_name: self.device.device_info_dynamic().carrier_name,
            gps_location: location.clone(),
            limit: self.config.app_inst_limit,
        };

        let (primary, fallback) = self.session_route();
        let (directory, request) = (&self.directory, &request);
        let (reply, _) = self
            .with_fallback(primary, fallback, move |endpoint| async move { directory.get_app_inst_list(&endpoint, request).await })
            .await
            .map_err(FindCloudletFailure::Transport)?;

        if reply.status != DirectoryStatus::Success {
            return Err(FindCloudletFailure::UnknownStatus(reply.status));
        }
        let candidates = reply.descriptors();
        if candidates.is_empty() {
            return Err(FindCloudletFailure::NoAppInstances);
        }

        let port = self.latency_test_port;
        let results = join_all(candidates.iter().map(|c| self.tester.measure_cloudlet(c, port))).await;

        candidates
            .into_iter()
            .zip(results)
            .filter_map(|(candidate, result)| match result {
                Ok(samples) => LatencyStats::from_samples(&samples).map(|stats| (candidate, stats)),
                Err(e) => {
                    debug!("candidate {} not reachable: {}", candidate.fqdn, e);
                    None
                }
            })
            .inspect(|(candidate, stats)| debug!("candidate {} avg {:.2}ms", candidate.fqdn, stats.avg))
            .min_by(|(_, a), (_, b)| a.avg.total_cmp(&b.avg))
            .ok_or(FindCloudletFailure::NoReachableCandidate)
    }

    async fn resolve(&self, mode: FindCloudletMode) -> Result<CloudletDescriptor, FindCloudletFailure> {
        let session_cookie = self.registry.session_cookie().ok_or(FindCloudletFailure::NotRegistered)?;
        let location = location_or_default(self.location.as_ref(), &self.default_location).await;

        let proximity = self.proximity_reply(&session_cookie, &location).await?;
        match mode {
            FindCloudletMode::Proximity => Ok(proximity.into_descriptor()),
            FindCloudletMode::Performance => {
                let cookie = Some(proximity.edge_events_cookie).filter(|c| !c.is_empty());
                let (mut best, stats) = self.performance_pick(&session_cookie, &location).await?;
                info!("performance pick {} ({:.2}ms avg)", best.fqdn, stats.avg);
                best.edge_events_cookie = cookie;
                Ok(best)
            }
        }
    }

    /// Resolve a cloudlet and make it the session's current one.
    pub async fn find_cloudlet(&self, mode: FindCloudletMode) -> Result<CloudletDescriptor, FindCloudletFailure> {
        let cloudlet = self.resolve(mode).await.inspect_err(|e| warn!("find cloudlet failed: {}", e))?;
        info!("found cloudlet {} ({:?} mode)", cloudlet.fqdn, mode);
        self.registry.record_cloudlet(cloudlet.clone());
        Ok(cloudlet)
    }

    /// Performance-mode resolution that leaves the current cloudlet untouched.
    pub async fn find_performance_candidate(&self) -> Result<CloudletDescriptor, FindCloudletFailure> {
        self.resolve(FindCloudletMode::Performance).await
    }

    pub async fn register_and_find_cloudlet(
        &self,
        identity: ClientIdentity,
        dme_host: Option<&str>,
        dme_port: Option<u16>,
        mode: FindCloudletMode,
    ) -> Result<CloudletDescriptor, ResolverError> {
        self.register(identity, dme_host, dme_port).await?;
        Ok(self.find_cloudlet(mode).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticLocation;
    use crate::directory::{AppInstListReply, AppInstance, CloudletLocation, RegisterClientReply};
    use crate::error::ProbeError;
    use crate::models::{AppPort, DeviceInfoDynamic, DeviceInfoStatic};
    use crate::probe::TransportProbe;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedDirectory {
        down: Vec<String>,
        find_status: Option<DirectoryStatus>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDirectory {
        fn check(&self, endpoint: &DirectoryEndpoint, op: &str) -> Result<(), DirectoryError> {
            self.calls.lock().push(format!("{op}@{}", endpoint.host));
            if self.down.contains(&endpoint.host) {
                return Err(DirectoryError::Unreachable { host: endpoint.host.clone(), reason: "down".into() });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DirectoryClient for ScriptedDirectory {
        async fn register_client(
            &self,
            endpoint: &DirectoryEndpoint,
            _request: &RegisterClientRequest,
        ) -> Result<RegisterClientReply, DirectoryError> {
            self.check(endpoint, "register")?;
            Ok(RegisterClientReply {
                status: DirectoryStatus::Success,
                session_cookie: "abc123".into(),
                token_server_uri: String::new(),
            })
        }

        async fn find_cloudlet(
            &self,
            endpoint: &DirectoryEndpoint,
            _request: &FindCloudletRequest,
        ) -> Result<FindCloudletReply, DirectoryError> {
            self.check(endpoint, "find")?;
            Ok(FindCloudletReply {
                status: self.find_status.unwrap_or(DirectoryStatus::Success),
                fqdn: "edge1.example.net".into(),
                ports: vec![AppPort::tcp(8008)],
                cloudlet_location: Some(Location::new(37.33, -121.88)),
                cloudlet_name: None,
                edge_events_cookie: "ee-1".into(),
            })
        }

        async fn get_app_inst_list(
            &self,
            endpoint: &DirectoryEndpoint,
            _request: &AppInstListRequest,
        ) -> Result<AppInstListReply, DirectoryError> {
            self.check(endpoint, "list")?;
            let instance = |fqdn: &str| AppInstance {
                app_name: "Game".into(),
                app_vers: "1.0".into(),
                fqdn: fqdn.into(),
                ports: vec![AppPort::tcp(8008)],
            };
            Ok(AppInstListReply {
                status: DirectoryStatus::Success,
                cloudlets: vec![CloudletLocation {
                    cloudlet_name: "bay".into(),
                    gps_location: Location::new(37.4, -122.0),
                    distance: 5.0,
                    appinstances: vec![instance("slow.example.net"), instance("fast.example.net")],
                }],
            })
        }
    }

    struct Carrier(Option<&'static str>);

    impl DeviceInfoProvider for Carrier {
        fn device_info_static(&self) -> DeviceInfoStatic {
            DeviceInfoStatic { device_os: "linux".into(), device_model: "test".into() }
        }

        fn device_info_dynamic(&self) -> DeviceInfoDynamic {
            DeviceInfoDynamic { data_network_type: "5G".into(), carrier_name: "acme".into(), signal_strength: None }
        }

        fn mcc_mnc(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    struct ByHost;

    #[async_trait]
    impl TransportProbe for ByHost {
        async fn connect_test(&self, host: &str, _port: u16) -> Result<f64, ProbeError> {
            Ok(if host.starts_with("fast") { 12.0 } else { 40.0 })
        }

        async fn ping_test(&self, host: &str) -> Result<f64, ProbeError> {
            Err(ProbeError::Timeout(host.into()))
        }
    }

    fn resolver(directory: Arc<ScriptedDirectory>, mcc_mnc: Option<&'static str>) -> CloudletResolver {
        CloudletResolver::new(
            directory,
            DirectoryConfig::default(),
            SessionRegistry::new(),
            Arc::new(StaticLocation(Location::new(37.33, -121.88))),
            Arc::new(Carrier(mcc_mnc)),
            LatencyTester::new(Arc::new(ByHost), 3),
        )
    }

    #[tokio::test]
    async fn test_find_requires_registration() {
        let directory = Arc::new(ScriptedDirectory::default());
        let resolver = resolver(directory.clone(), None);

        let err = resolver.find_cloudlet(FindCloudletMode::Proximity).await.unwrap_err();
        assert_eq!(err, FindCloudletFailure::NotRegistered);
        assert!(directory.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_carrier_host_falls_back_to_wifi() {
        let directory = Arc::new(ScriptedDirectory {
            down: vec!["310-260.dme.edgelink.net".into()],
            ..Default::default()
        });
        let resolver = resolver(directory.clone(), Some("310-260"));

        let cookie = resolver.register(ClientIdentity::new("Acme", "Game", "1.0"), None, None).await.unwrap();
        assert_eq!(cookie, "abc123");
        assert_eq!(
            *directory.calls.lock(),
            vec!["register@310-260.dme.edgelink.net", "register@wifi.dme.edgelink.net"]
        );
        assert_eq!(resolver.registry().directory_endpoint().unwrap().host, "wifi.dme.edgelink.net");
    }

    #[tokio::test]
    async fn test_explicit_host_has_no_fallback() {
        let directory = Arc::new(ScriptedDirectory { down: vec!["dme.local".into()], ..Default::default() });
        let resolver = resolver(directory.clone(), Some("310-260"));

        let err = resolver
            .register(ClientIdentity::new("Acme", "Game", "1.0"), Some("dme.local"), Some(50051))
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterFailure::Transport(DirectoryError::Unreachable { .. })));
        assert_eq!(directory.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_proximity_records_cloudlet() {
        let resolver = resolver(Arc::new(ScriptedDirectory::default()), None);
        let cloudlet = resolver
            .register_and_find_cloudlet(ClientIdentity::new("Acme", "Game", "1.0"), None, None, FindCloudletMode::Proximity)
            .await
            .unwrap();

        assert_eq!(cloudlet.fqdn, "edge1.example.net");
        assert_eq!(cloudlet.ports[0].public_port, 8008);
        let cookies = resolver.registry().cookies().unwrap();
        assert_eq!(cookies.session_cookie, "abc123");
        assert_eq!(cookies.edge_events_cookie, "ee-1");
    }

    #[tokio::test]
    async fn test_unrecognised_find_status_fails() {
        let status: DirectoryStatus = serde_json::from_str("\"FIND_WHATEVER\"").unwrap();
        let directory = Arc::new(ScriptedDirectory { find_status: Some(status), ..Default::default() });
        let resolver = resolver(directory, None);
        resolver.register(ClientIdentity::new("Acme", "Game", "1.0"), None, None).await.unwrap();

        let err = resolver.find_cloudlet(FindCloudletMode::Proximity).await.unwrap_err();
        assert_eq!(err, FindCloudletFailure::UnknownStatus(DirectoryStatus::Unknown));
        assert!(resolver.registry().current_cloudlet().is_none());
    }

    #[tokio::test]
    async fn test_performance_picks_lowest_latency() {
        let resolver = resolver(Arc::new(ScriptedDirectory::default()), None);
        resolver.register(ClientIdentity::new("Acme", "Game", "1.0"), None, None).await.unwrap();

        let candidate = resolver.find_performance_candidate().await.unwrap();
        assert_eq!(candidate.fqdn, "fast.example.net");
        assert_eq!(candidate.edge_events_cookie.as_deref(), Some("ee-1"));
        // Candidate search leaves the session alone
        assert!(resolver.registry().current_cloudlet().is_none());

        let chosen = resolver.find_cloudlet(FindCloudletMode::Performance).await.unwrap();
        assert_eq!(resolver.registry().current_cloudlet().unwrap().fqdn, chosen.fqdn);
    }
}
