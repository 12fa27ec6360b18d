//! Migration cutover and host notifications
//!
//! An approved decision moves the session to the candidate cloudlet:
//! stop loops → close channel → swap cloudlet + cookie → reopen → restart
//! loops → `on_connection_upgrade`. Without auto-migration the cutover stops
//! after closing and the candidate is parked for the host.
//!
//! Rejections are reported through `on_connection_failure` when they carry
//! a reportable reason; everything else is only logged.

use crate::channel::{EdgeEventsChannel, ServerTrigger};
use crate::device::DeviceInfoProvider;
use crate::error::{EdgeEventsFailure, FailureReason, SetupError};
use crate::evaluator::{MigrationDecision, MigrationEvaluator};
use crate::models::CloudletDescriptor;
use crate::registry::SessionRegistry;
use crate::scheduler::UpdateScheduler;
use crate::state::{new_state, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Payload of `on_connection_upgrade`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionUpgrade {
    pub trigger: ServerTrigger,
    pub cloudlet: CloudletDescriptor,
    /// `false` when auto-migration is off and the host must act
    pub migrated: bool,
}

pub type UpgradeCallback = Arc<dyn Fn(ConnectionUpgrade) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(EdgeEventsFailure) + Send + Sync>;

/// Host callbacks as supplied; both are required to start edge events.
#[derive(Default)]
pub struct HostCallbacks {
    on_connection_upgrade: Option<UpgradeCallback>,
    on_connection_failure: Option<FailureCallback>,
}

impl HostCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection_upgrade(mut self, callback: impl Fn(ConnectionUpgrade) + Send + Sync + 'static) -> Self {
        self.on_connection_upgrade = Some(Arc::new(callback));
        self
    }

    pub fn on_connection_failure(mut self, callback: impl Fn(EdgeEventsFailure) + Send + Sync + 'static) -> Self {
        self.on_connection_failure = Some(Arc::new(callback));
        self
    }

    pub fn into_handlers(self) -> Result<HostHandlers, SetupError> {
        Ok(HostHandlers {
            upgrade: self.on_connection_upgrade.ok_or(SetupError::MissingCallback("on_connection_upgrade"))?,
            failure: self.on_connection_failure.ok_or(SetupError::MissingCallback("on_connection_failure"))?,
        })
    }
}

/// Validated callbacks
#[derive(Clone)]
pub struct HostHandlers {
    upgrade: UpgradeCallback,
    failure: FailureCallback,
}

impl HostHandlers {
    pub fn notify_upgrade(&self, upgrade: ConnectionUpgrade) {
        info!(
            "connection upgrade to {} (migrated: {}, trigger {})",
            upgrade.cloudlet.fqdn,
            upgrade.migrated,
            upgrade.trigger.name()
        );
        (self.upgrade)(upgrade);
    }

    pub fn notify_failure(&self, failure: EdgeEventsFailure) {
        if failure.reason.is_hard_failure() {
            error!("edge events failure: {}", failure);
        } else {
            info!("edge events skip: {}", failure);
        }
        (self.failure)(failure);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoordinatorState {
    #[default]
    Idle,
    Evaluating,
    Migrating,
}

/// What `migrate` did with a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Rejected,
    /// Auto-migration off: loops stopped, channel closed, candidate parked
    CandidateParked,
    Migrated,
    ReopenFailed,
    /// Another cutover was already running
    Busy,
    /// The session was stopped before the decision could be applied
    Cancelled,
}

#[derive(Clone)]
pub struct MigrationCoordinator {
    evaluator: MigrationEvaluator,
    registry: SessionRegistry,
    channel: EdgeEventsChannel,
    scheduler: UpdateScheduler,
    device: Arc<dyn DeviceInfoProvider>,
    handlers: HostHandlers,
    auto_migration: bool,
    state: Shared<CoordinatorState>,
    stopped: Arc<AtomicBool>,
}

impl MigrationCoordinator {
    pub fn new(
        evaluator: MigrationEvaluator,
        registry: SessionRegistry,
        channel: EdgeEventsChannel,
        scheduler: UpdateScheduler,
        device: Arc<dyn DeviceInfoProvider>,
        handlers: HostHandlers,
        auto_migration: bool,
    ) -> Self {
        Self {
            evaluator,
            registry,
            channel,
            scheduler,
            device,
            handlers,
            auto_migration,
            state: new_state(CoordinatorState::Idle),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse every decision from now on. Evaluations still in flight end
    /// without touching the session or calling the host.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    pub fn handlers(&self) -> &HostHandlers {
        &self.handlers
    }

    fn set_state(&self, next: CoordinatorState) {
        *self.state.lock() = next;
    }

    /// Evaluate a trigger and act on the decision.
    pub async fn handle_trigger(&self, trigger: ServerTrigger) -> MigrationOutcome {
        {
            let mut state = self.state.lock();
            if *state == CoordinatorState::Idle {
                *state = CoordinatorState::Evaluating;
            }
        }
        let decision = self.evaluator.evaluate(trigger).await;
        self.migrate(decision).await
    }

    pub async fn migrate(&self, decision: MigrationDecision) -> MigrationOutcome {
        if self.is_stopped() {
            self.finish_evaluation();
            info!("{} dropped, edge events stopped", decision.trigger.name());
            return MigrationOutcome::Cancelled;
        }
        let candidate = match (decision.approved, decision.candidate.clone()) {
            (true, Some(candidate)) => candidate,
            _ => {
                self.finish_evaluation();
                match decision.failure() {
                    Some(failure) => self.handlers.notify_failure(failure),
                    None if decision.reason.discards_signal() => {
                        warn!("{} dropped: {}", decision.trigger.name(), decision.reason)
                    }
                    None => debug!("{} dropped: {}", decision.trigger.name(), decision.reason),
                }
                return MigrationOutcome::Rejected;
            }
        };

        {
            let mut state = self.state.lock();
            if *state == CoordinatorState::Migrating {
                warn!("migration to {} dropped, another cutover is running", candidate.fqdn);
                return MigrationOutcome::Busy;
            }
            *state = CoordinatorState::Migrating;
        }

        info!("migrating to {} ({})", candidate.fqdn, decision.reason);
        self.scheduler.stop_updates();
        self.channel.close().await;

        if !self.auto_migration {
            self.registry.set_candidate(candidate.clone());
            self.set_state(CoordinatorState::Idle);
            self.handlers.notify_upgrade(ConnectionUpgrade { trigger: decision.trigger, cloudlet: candidate, migrated: false });
            return MigrationOutcome::CandidateParked;
        }

        self.cut_over(decision.trigger, Arc::new(candidate)).await
    }

    /// Move to the parked candidate (auto-migration off).
    pub async fn accept_parked_candidate(&self) -> Option<MigrationOutcome> {
        let candidate = self.registry.candidate()?;
        {
            let mut state = self.state.lock();
            if *state == CoordinatorState::Migrating {
                return Some(MigrationOutcome::Busy);
            }
            *state = CoordinatorState::Migrating;
        }
        let trigger = ServerTrigger::CloudletUpdate(Some((*candidate).clone()));
        Some(self.cut_over(trigger, candidate).await)
    }

    async fn cut_over(&self, trigger: ServerTrigger, candidate: Arc<CloudletDescriptor>) -> MigrationOutcome {
        if self.is_stopped() {
            self.set_state(CoordinatorState::Idle);
            info!("migration to {} cancelled, edge events stopped", candidate.fqdn);
            return MigrationOutcome::Cancelled;
        }
        self.registry.promote(candidate.clone());

        let reopened = self
            .channel
            .open(self.device.device_info_static(), self.device.device_info_dynamic())
            .await;
        if self.is_stopped() {
            // Stopped while reopening: leave nothing running
            self.channel.close().await;
            self.set_state(CoordinatorState::Idle);
            return MigrationOutcome::Cancelled;
        }
        if let Err(e) = reopened {
            self.scheduler.stop_updates();
            self.set_state(CoordinatorState::Idle);
            self.handlers.notify_failure(EdgeEventsFailure::new(
                FailureReason::MigrationReopenFailed,
                format!("reopening edge events on {}: {}", candidate.fqdn, e),
            ));
            return MigrationOutcome::ReopenFailed;
        }

        self.scheduler.restart_updates();
        self.set_state(CoordinatorState::Idle);
        self.handlers.notify_upgrade(ConnectionUpgrade { trigger, cloudlet: (*candidate).clone(), migrated: true });
        MigrationOutcome::Migrated
    }

    fn finish_evaluation(&self) {
        let mut state = self.state.lock();
        if *state == CoordinatorState::Evaluating {
            *state = CoordinatorState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EventEndpoint, EventStream, EventTransport};
    use crate::config::{EdgeEventsConfig, EventsConfig, UpdateConfig};
    use crate::directory::DirectoryEndpoint;
    use crate::error::{ChannelError, FindCloudletFailure, ProbeError};
    use crate::evaluator::CandidateSource;
    use crate::models::{AppPort, ClientIdentity, DeviceInfoDynamic, DeviceInfoStatic, Location};
    use crate::probe::{LatencyTester, TransportProbe};
    use crate::scheduler::{LoopKind, UpdateSender, UpdateStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    struct Unreachable;

    #[async_trait]
    impl EventTransport for Unreachable {
        async fn connect(&self, endpoint: &EventEndpoint) -> Result<EventStream, ChannelError> {
            Err(ChannelError::Transport(format!("{} refused", endpoint.host)))
        }
    }

    struct NoCandidate;

    #[async_trait]
    impl CandidateSource for NoCandidate {
        async fn performance_candidate(&self) -> Result<CloudletDescriptor, FindCloudletFailure> {
            Err(FindCloudletFailure::NoAppInstances)
        }
    }

    struct Silent;

    #[async_trait]
    impl TransportProbe for Silent {
        async fn connect_test(&self, host: &str, _port: u16) -> Result<f64, ProbeError> {
            Err(ProbeError::Timeout(host.into()))
        }

        async fn ping_test(&self, host: &str) -> Result<f64, ProbeError> {
            Err(ProbeError::Timeout(host.into()))
        }
    }

    #[async_trait]
    impl UpdateSender for Silent {
        async fn send_update(&self, _kind: LoopKind) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    struct Device;

    impl DeviceInfoProvider for Device {
        fn device_info_static(&self) -> DeviceInfoStatic {
            DeviceInfoStatic::default()
        }

        fn device_info_dynamic(&self) -> DeviceInfoDynamic {
            DeviceInfoDynamic::default()
        }
    }

    fn cloudlet(fqdn: &str, cookie: &str) -> CloudletDescriptor {
        let mut c = CloudletDescriptor::new(fqdn, vec![AppPort::tcp(8008)], Location::new(37.33, -121.88));
        c.edge_events_cookie = Some(cookie.into());
        c
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    fn coordinator(auto_migration: bool) -> (MigrationCoordinator, UpdateScheduler, Seen) {
        let registry = SessionRegistry::new();
        registry.record_registration(
            ClientIdentity::new("Acme", "Game", "1.0"),
            "abc123".into(),
            DirectoryEndpoint::new("wifi.dme.edgelink.net", 38001),
        );
        registry.record_cloudlet(cloudlet("edge1.example.net", "ee-1"));

        let tester = LatencyTester::new(Arc::new(Silent), 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = EdgeEventsChannel::new(Arc::new(Unreachable), EventsConfig::default(), registry.clone(), tester.clone(), tx);
        let scheduler = UpdateScheduler::new(Arc::new(Silent));
        let evaluator =
            MigrationEvaluator::new(Arc::new(EdgeEventsConfig::default()), registry.clone(), Arc::new(NoCandidate), tester);

        let seen: Seen = Arc::default();
        let (ups, fails) = (seen.clone(), seen.clone());
        let handlers = HostCallbacks::new()
            .on_connection_upgrade(move |u| ups.lock().push(format!("upgrade:{}:{}", u.cloudlet.fqdn, u.migrated)))
            .on_connection_failure(move |f| fails.lock().push(format!("failure:{:?}", f.reason)))
            .into_handlers()
            .unwrap();

        let coordinator = MigrationCoordinator::new(
            evaluator,
            registry,
            channel,
            scheduler.clone(),
            Arc::new(Device),
            handlers,
            auto_migration,
        );
        (coordinator, scheduler, seen)
    }

    #[test]
    fn test_missing_callback_is_setup_error() {
        let err = HostCallbacks::new().on_connection_upgrade(|_| {}).into_handlers().err();
        assert_eq!(err, Some(SetupError::MissingCallback("on_connection_failure")));
    }

    #[tokio::test]
    async fn test_rejections_reported_by_reason() {
        let (coordinator, _, seen) = coordinator(true);

        let outcome = coordinator.handle_trigger(ServerTrigger::CloudletUpdate(None)).await;
        assert_eq!(outcome, MigrationOutcome::Rejected);
        coordinator.handle_trigger(ServerTrigger::InitConnection).await;
        coordinator.handle_trigger(ServerTrigger::Error("quota".into())).await;

        assert_eq!(*seen.lock(), vec!["failure:NoReplacementCloudlet", "failure:ServerError"]);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_reopen_failure_ends_session() {
        let (coordinator, scheduler, seen) = coordinator(true);
        scheduler.start_location_updates(UpdateConfig::on_interval(30, 0));

        let trigger = ServerTrigger::CloudletUpdate(Some(cloudlet("edge2.example.net", "ee-2")));
        assert_eq!(coordinator.handle_trigger(trigger).await, MigrationOutcome::ReopenFailed);

        assert_eq!(*seen.lock(), vec!["failure:MigrationReopenFailed"]);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert_eq!(scheduler.state(LoopKind::Location).status, UpdateStatus::Stopped);
        // The swap itself happened before the reopen attempt
        assert_eq!(coordinator.registry.current_cloudlet().unwrap().fqdn, "edge2.example.net");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_late_decisions() {
        let (coordinator, _, seen) = coordinator(true);
        coordinator.shutdown();

        let trigger = ServerTrigger::CloudletUpdate(Some(cloudlet("edge2.example.net", "ee-2")));
        assert_eq!(coordinator.handle_trigger(trigger).await, MigrationOutcome::Cancelled);
        assert_eq!(coordinator.handle_trigger(ServerTrigger::CloudletUpdate(None)).await, MigrationOutcome::Cancelled);

        assert!(seen.lock().is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert_eq!(coordinator.registry.current_cloudlet().unwrap().fqdn, "edge1.example.net");
    }

    #[tokio::test]
    async fn test_manual_migration_parks_candidate() {
        let (coordinator, scheduler, seen) = coordinator(false);
        scheduler.start_latency_updates(UpdateConfig::on_interval(30, 0));

        let trigger = ServerTrigger::MaintenanceChanged {
            state: "UNDER_MAINTENANCE".into(),
            new_cloudlet: Some(cloudlet("edge2.example.net", "ee-2")),
        };
        assert_eq!(coordinator.handle_trigger(trigger).await, MigrationOutcome::CandidateParked);

        assert_eq!(*seen.lock(), vec!["upgrade:edge2.example.net:false"]);
        assert_eq!(coordinator.registry.current_cloudlet().unwrap().fqdn, "edge1.example.net");
        assert_eq!(coordinator.registry.candidate().unwrap().fqdn, "edge2.example.net");
        assert_eq!(scheduler.state(LoopKind::Latency).status, UpdateStatus::Stopped);
    }
}
