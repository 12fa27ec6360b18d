//! Edge-events session facade
//!
//! `EdgeEventsManager::start` wires one session together:
//! - validates config and host callbacks (fatal on error)
//! - opens the channel with the registry's cookies
//! - starts the location and latency loops
//! - spawns the trigger dispatcher
//!
//! The dispatcher consumes server triggers in arrival order. Latency
//! requests get an immediate out-of-band test, sent even while updates are
//! paused; processed-latency reports are evaluated on their own task since
//! they may run a performance resolution; everything else is evaluated
//! inline. Stopping aborts those tasks and shuts the coordinator, so a late
//! decision never touches a stopped session.

use crate::channel::{EdgeEventsChannel, EventTransport, ServerTrigger};
use crate::config::{EdgeEventsConfig, EventsConfig};
use crate::coordinator::{CoordinatorState, HostCallbacks, MigrationCoordinator, MigrationOutcome};
use crate::device::{location_or_default, DeviceInfoProvider, LocationProvider};
use crate::error::{ChannelError, EdgeEventsFailure, FailureReason, SetupError};
use crate::evaluator::MigrationEvaluator;
use crate::models::{CloudletDescriptor, DeviceInfoDynamic, Location};
use crate::probe::LatencyTester;
use crate::registry::SessionRegistry;
use crate::resolver::CloudletResolver;
use crate::scheduler::{LoopKind, UpdateScheduler, UpdateSender, UpdatesState};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Builds and sends one telemetry frame per scheduler tick
#[derive(Clone)]
struct TelemetrySender {
    channel: EdgeEventsChannel,
    registry: SessionRegistry,
    location: Arc<dyn LocationProvider>,
    device: Arc<dyn DeviceInfoProvider>,
    default_location: Location,
    latency_test_port: u16,
}

impl TelemetrySender {
    /// Location and device info are read fresh for every send.
    async fn inputs(&self) -> (Location, DeviceInfoDynamic) {
        let location = location_or_default(self.location.as_ref(), &self.default_location).await;
        (location, self.device.device_info_dynamic())
    }

    fn current_cloudlet(&self) -> Result<Arc<CloudletDescriptor>, ChannelError> {
        Ok(self.registry.current_cloudlet().ok_or(SetupError::NoCurrentCloudlet)?)
    }

    /// Server-requested latency test; bypasses a pause.
    async fn answer_latency_request(&self) -> Result<(), ChannelError> {
        let (location, dynamic) = self.inputs().await;
        let cloudlet = self.current_cloudlet()?;
        self.channel
            .answer_latency_request(&cloudlet, self.latency_test_port, location, dynamic)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl UpdateSender for TelemetrySender {
    async fn send_update(&self, kind: LoopKind) -> Result<(), ChannelError> {
        let (location, dynamic) = self.inputs().await;
        let sent = match kind {
            LoopKind::Location => self.channel.post_location_update(location, dynamic)?,
            LoopKind::Latency => {
                let cloudlet = self.current_cloudlet()?;
                self.channel
                    .test_and_post_latency_update(&cloudlet, self.latency_test_port, location, dynamic)
                    .await?
            }
        };
        if !sent {
            debug!("{:?} update held back, edge events paused", kind);
        }
        Ok(())
    }
}

struct Session {
    channel: EdgeEventsChannel,
    scheduler: UpdateScheduler,
    coordinator: MigrationCoordinator,
    dispatcher: JoinHandle<()>,
}

pub struct EdgeEventsManager {
    config: Arc<EdgeEventsConfig>,
    events: EventsConfig,
    resolver: Arc<CloudletResolver>,
    transport: Arc<dyn EventTransport>,
    location: Arc<dyn LocationProvider>,
    device: Arc<dyn DeviceInfoProvider>,
    session: Shared<Option<Session>>,
}

impl EdgeEventsManager {
    pub fn new(
        config: EdgeEventsConfig,
        events: EventsConfig,
        resolver: Arc<CloudletResolver>,
        transport: Arc<dyn EventTransport>,
        location: Arc<dyn LocationProvider>,
        device: Arc<dyn DeviceInfoProvider>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            events,
            resolver,
            transport,
            location,
            device,
            session: new_state(None),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.resolver.registry()
    }

    pub fn resolver(&self) -> &Arc<CloudletResolver> {
        &self.resolver
    }

    pub fn current_cloudlet(&self) -> Option<Arc<CloudletDescriptor>> {
        self.registry().current_cloudlet()
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Start edge events for the registered session.
    pub async fn start(&self, callbacks: HostCallbacks) -> Result<(), ChannelError> {
        if self.is_running() {
            return Err(SetupError::AlreadyStarted.into());
        }
        self.config.validate().inspect_err(|e| warn!("edge events setup rejected: {}", e))?;
        let handlers = callbacks.into_handlers().inspect_err(|e| warn!("edge events setup rejected: {}", e))?;

        let registry = self.registry().clone();
        let tester = LatencyTester::new(self.resolver.tester().probe().clone(), self.config.samples_per_test);
        let (subscriber, triggers) = mpsc::unbounded_channel();
        let channel =
            EdgeEventsChannel::new(self.transport.clone(), self.events.clone(), registry.clone(), tester.clone(), subscriber);

        let telemetry = TelemetrySender {
            channel: channel.clone(),
            registry: registry.clone(),
            location: self.location.clone(),
            device: self.device.clone(),
            default_location: self.config.default_location.clone(),
            latency_test_port: self.config.latency_test_port,
        };
        let scheduler = UpdateScheduler::new(Arc::new(telemetry.clone()));
        let evaluator = MigrationEvaluator::new(self.config.clone(), registry.clone(), self.resolver.clone(), tester);
        let coordinator = MigrationCoordinator::new(
            evaluator,
            registry,
            channel.clone(),
            scheduler.clone(),
            self.device.clone(),
            handlers.clone(),
            self.config.auto_migration,
        );

        if let Err(e) = channel.open(self.device.device_info_static(), self.device.device_info_dynamic()).await {
            if !matches!(e, ChannelError::Setup(_)) {
                handlers.notify_failure(EdgeEventsFailure::new(FailureReason::ChannelFailed, e.to_string()));
            }
            return Err(e);
        }

        scheduler.start_location_updates(self.config.location_update.clone());
        scheduler.start_latency_updates(self.config.latency_update.clone());
        let dispatcher = tokio::spawn(dispatch(triggers, coordinator.clone(), telemetry));

        let started = Session { channel, scheduler, coordinator, dispatcher };
        let lost_race = {
            let mut session = self.session.lock();
            if session.is_some() {
                Some(started)
            } else {
                *session = Some(started);
                None
            }
        };
        if let Some(ours) = lost_race {
            ours.coordinator.shutdown();
            ours.dispatcher.abort();
            ours.scheduler.stop_updates();
            ours.channel.close().await;
            return Err(SetupError::AlreadyStarted.into());
        }
        info!("edge events started");
        Ok(())
    }

    /// Stop loops, close the channel and invalidate the session cookies.
    pub async fn stop(&self) {
        let Some(session) = self.session.lock().take() else {
            debug!("stop called while edge events not running");
            return;
        };
        session.coordinator.shutdown();
        session.scheduler.stop_updates();
        // Dropping the dispatcher drops its evaluation set, aborting them all
        session.dispatcher.abort();
        session.channel.close().await;
        self.registry().clear_cookies();
        info!("edge events stopped");
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Option<T> {
        self.session.lock().as_ref().map(f)
    }

    pub fn pause(&self) {
        self.with_session(|s| {
            s.scheduler.pause_updates();
            s.channel.pause_sending_updates();
        });
    }

    pub fn resume(&self) {
        self.with_session(|s| {
            s.channel.resume_sending_updates();
            s.scheduler.resume_updates();
        });
    }

    /// Manual location send; `false` when nothing was sent.
    pub async fn poll_location(&self) -> bool {
        match self.with_session(|s| s.scheduler.clone()) {
            Some(scheduler) => scheduler.poll_now(LoopKind::Location).await,
            None => false,
        }
    }

    /// Manual latency test and send; `false` when nothing was sent.
    pub async fn poll_latency(&self) -> bool {
        match self.with_session(|s| s.scheduler.clone()) {
            Some(scheduler) => scheduler.poll_now(LoopKind::Latency).await,
            None => false,
        }
    }

    pub fn updates_state(&self, kind: LoopKind) -> Option<UpdatesState> {
        self.with_session(|s| s.scheduler.state(kind))
    }

    pub fn coordinator_state(&self) -> Option<CoordinatorState> {
        self.with_session(|s| s.coordinator.state())
    }

    /// Migrate to the candidate parked while auto-migration is off.
    pub async fn accept_parked_candidate(&self) -> Option<MigrationOutcome> {
        let coordinator = self.with_session(|s| s.coordinator.clone())?;
        coordinator.accept_parked_candidate().await
    }
}

async fn dispatch(
    mut triggers: mpsc::UnboundedReceiver<ServerTrigger>,
    coordinator: MigrationCoordinator,
    telemetry: TelemetrySender,
) {
    let mut evaluations = JoinSet::new();
    while let Some(trigger) = triggers.recv().await {
        while evaluations.try_join_next().is_some() {}
        match trigger {
            ServerTrigger::InitConnection => debug!("server acknowledged edge events connection"),
            ServerTrigger::LatencyRequest => {
                // Out of band: the latency loop's counter is untouched
                if let Err(e) = telemetry.answer_latency_request().await {
                    coordinator
                        .handlers()
                        .notify_failure(EdgeEventsFailure::new(FailureReason::LatencyTestFailed, e.to_string()));
                }
            }
            ServerTrigger::LatencyProcessed(_) => {
                let coordinator = coordinator.clone();
                evaluations.spawn(async move {
                    coordinator.handle_trigger(trigger).await;
                });
            }
            other => {
                coordinator.handle_trigger(other).await;
            }
        }
    }
    debug!("trigger dispatcher finished");
}
