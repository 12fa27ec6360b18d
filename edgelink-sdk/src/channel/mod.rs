//! Edge-events channel: the persistent bidirectional stream to the server
//!
//! Each open/close cycle owns:
//! - one transport connection (`EventTransport`)
//! - a send task draining the outbound queue in order
//! - a receive task decoding frames into `ServerTrigger`s for the single
//!   subscriber
//!
//! Telemetry posts only enqueue; latency tests run in the caller's task, so
//! nothing on the send side can stall the receive path.

pub mod transport;
pub mod wire;

pub use transport::{EventEndpoint, EventSink, EventStream, EventTransport, MqttEventTransport};
pub use wire::{ClientEdgeEvent, ClientEventType, FrameError, ServerEdgeEvent, ServerTrigger};

use crate::config::EventsConfig;
use crate::error::{ChannelError, SetupError};
use crate::models::{CloudletDescriptor, DeviceInfoDynamic, DeviceInfoStatic, LatencySample, Location};
use crate::probe::{LatencyTester, TestTarget};
use crate::registry::{SessionCookies, SessionRegistry};
use crate::state::{new_state, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Who asked for a telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Update loops and manual polls; held back while paused
    Scheduled,
    /// Server `LatencyRequest`; always sent
    Requested,
}

/// Resources of one open/close cycle
struct OpenConnection {
    cookies: SessionCookies,
    sink: Arc<dyn EventSink>,
    outbound: mpsc::UnboundedSender<ClientEdgeEvent>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct EdgeEventsChannel {
    transport: Arc<dyn EventTransport>,
    config: EventsConfig,
    registry: SessionRegistry,
    tester: LatencyTester,
    subscriber: mpsc::UnboundedSender<ServerTrigger>,
    connection: Shared<Option<OpenConnection>>,
    paused: Arc<AtomicBool>,
    client_id: String,
}

impl EdgeEventsChannel {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        config: EventsConfig,
        registry: SessionRegistry,
        tester: LatencyTester,
        subscriber: mpsc::UnboundedSender<ServerTrigger>,
    ) -> Self {
        Self {
            transport,
            config,
            registry,
            tester,
            subscriber,
            connection: new_state(None),
            paused: Arc::new(AtomicBool::new(false)),
            client_id: format!("edgelink-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn tester(&self) -> &LatencyTester {
        &self.tester
    }

    /// Connect with the session's current cookies and announce the device.
    pub async fn open(&self, device_static: DeviceInfoStatic, device_dynamic: DeviceInfoDynamic) -> Result<(), ChannelError> {
        if self.is_open() {
            return Err(ChannelError::Setup(SetupError::AlreadyStarted));
        }
        // Both cookies must be present before any network activity
        let cookies = self.registry.cookies()?;

        let default_host = self
            .registry
            .directory_endpoint()
            .map(|e| e.host)
            .or_else(|| self.registry.current_cloudlet().map(|c| c.fqdn.clone()))
            .unwrap_or_else(|| "localhost".to_string());
        let endpoint = EventEndpoint::from_config(
            &self.config,
            &default_host,
            self.client_id.clone(),
            cookies.edge_events_cookie.clone(),
        );

        let EventStream { sink, inbound } = self.transport.connect(&endpoint).await?;
        let sink: Arc<dyn EventSink> = Arc::from(sink);

        let (outbound, queue) = mpsc::unbounded_channel();
        let send_task = tokio::spawn(run_sender(sink.clone(), queue));
        let recv_task = tokio::spawn(run_receiver(inbound, self.subscriber.clone()));

        outbound
            .send(ClientEdgeEvent::init_connection(&cookies, device_static, device_dynamic))
            .map_err(|_| ChannelError::Transport("send task stopped".into()))?;

        let mut connection = self.connection.lock();
        if connection.is_some() {
            // Lost a race with a concurrent open; keep the winner
            send_task.abort();
            recv_task.abort();
            return Err(ChannelError::Setup(SetupError::AlreadyStarted));
        }
        *connection = Some(OpenConnection { cookies, sink, outbound, send_task, recv_task });
        self.paused.store(false, Ordering::SeqCst);
        info!("edge events channel open on {}", endpoint.client_topic());
        Ok(())
    }

    /// Terminate the connection. Frames already queued are flushed first,
    /// within the terminate timeout; whatever is left after that is dropped.
    pub async fn close(&self) {
        let Some(connection) = self.connection.lock().take() else {
            debug!("close on a channel that is not open");
            return;
        };
        let OpenConnection { cookies, sink, outbound, mut send_task, recv_task } = connection;

        // The send task drains the queue and exits once every sender is gone
        drop(outbound);
        if tokio::time::timeout(TERMINATE_TIMEOUT, &mut send_task).await.is_err() {
            warn!("send queue not drained within {:?}, dropping the rest", TERMINATE_TIMEOUT);
            send_task.abort();
        }

        let terminate = ClientEdgeEvent::terminate_connection(&cookies);
        match serde_json::to_vec(&terminate) {
            Ok(frame) => match tokio::time::timeout(TERMINATE_TIMEOUT, sink.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("terminate frame not delivered: {}", e),
                Err(_) => debug!("terminate frame timed out"),
            },
            Err(e) => debug!("terminate frame not encoded: {}", e),
        }
        sink.close().await;
        // The receive task ends when the transport closes its inbound side
        drop(recv_task);
        info!("edge events channel closed");
    }

    pub fn pause_sending_updates(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("edge events telemetry paused");
        }
    }

    pub fn resume_sending_updates(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("edge events telemetry resumed");
        }
    }

    fn open_queue(&self) -> Result<(mpsc::UnboundedSender<ClientEdgeEvent>, SessionCookies), ChannelError> {
        let connection = self.connection.lock();
        let connection = connection.as_ref().ok_or(ChannelError::NotOpen)?;
        Ok((connection.outbound.clone(), connection.cookies.clone()))
    }

    /// Whether `delivery` is held back right now
    fn held(&self, delivery: Delivery) -> bool {
        delivery == Delivery::Scheduled && self.is_paused()
    }

    /// Queue a frame built from the open connection's cookies. `Ok(false)`
    /// when a scheduled telemetry frame is held back by a pause.
    fn post(
        &self,
        delivery: Delivery,
        build: impl FnOnce(&SessionCookies) -> ClientEdgeEvent,
    ) -> Result<bool, ChannelError> {
        let (outbound, cookies) = self.open_queue()?;
        let event = build(&cookies);
        if event.is_telemetry() && self.held(delivery) {
            debug!("{:?} held back while paused", event.event_type);
            return Ok(false);
        }
        outbound
            .send(event)
            .map(|_| true)
            .map_err(|_| ChannelError::Transport("send task stopped".into()))
    }

    /// Queue a location update. `Ok(false)` when sending is paused.
    pub fn post_location_update(&self, location: Location, device_dynamic: DeviceInfoDynamic) -> Result<bool, ChannelError> {
        self.post(Delivery::Scheduled, |cookies| ClientEdgeEvent::location_update(cookies, location, device_dynamic))
    }

    /// Run a TCP connect test against `host:port` and queue the samples.
    pub async fn test_connect_and_post_latency_update(
        &self,
        host: &str,
        port: u16,
        location: Location,
        device_dynamic: DeviceInfoDynamic,
    ) -> Result<bool, ChannelError> {
        let target = TestTarget::Connect { host: host.to_string(), port };
        self.run_latency_test(target, Delivery::Scheduled, location, device_dynamic).await
    }

    /// Run a ping test against `host` and queue the samples.
    pub async fn test_ping_and_post_latency_update(
        &self,
        host: &str,
        location: Location,
        device_dynamic: DeviceInfoDynamic,
    ) -> Result<bool, ChannelError> {
        let target = TestTarget::Ping { host: host.to_string() };
        self.run_latency_test(target, Delivery::Scheduled, location, device_dynamic).await
    }

    async fn run_latency_test(
        &self,
        target: TestTarget,
        delivery: Delivery,
        location: Location,
        device_dynamic: DeviceInfoDynamic,
    ) -> Result<bool, ChannelError> {
        self.open_queue()?;
        // A held update skips the probe as well
        if self.held(delivery) {
            debug!("latency test skipped while paused");
            return Ok(false);
        }
        let samples = match target {
            TestTarget::Connect { host, port } => self.tester.connect_samples(&host, port).await?,
            TestTarget::Ping { host } => self.tester.ping_samples(&host).await?,
        };
        self.post(delivery, |cookies| ClientEdgeEvent::latency_samples(cookies, samples, location, device_dynamic))
    }

    /// Latency test against a cloudlet: connect on `preferred_port` (or the
    /// first TCP port), ping when there is none.
    pub async fn test_and_post_latency_update(
        &self,
        cloudlet: &CloudletDescriptor,
        preferred_port: u16,
        location: Location,
        device_dynamic: DeviceInfoDynamic,
    ) -> Result<bool, ChannelError> {
        let target = LatencyTester::target_for(cloudlet, preferred_port)?;
        self.run_latency_test(target, Delivery::Scheduled, location, device_dynamic).await
    }

    /// Answer a server latency request. The server asked for these samples,
    /// so a pause does not hold them back.
    pub async fn answer_latency_request(
        &self,
        cloudlet: &CloudletDescriptor,
        preferred_port: u16,
        location: Location,
        device_dynamic: DeviceInfoDynamic,
    ) -> Result<bool, ChannelError> {
        let target = LatencyTester::target_for(cloudlet, preferred_port)?;
        self.run_latency_test(target, Delivery::Requested, location, device_dynamic).await
    }
}

async fn run_sender(sink: Arc<dyn EventSink>, mut queue: mpsc::UnboundedReceiver<ClientEdgeEvent>) {
    while let Some(event) = queue.recv().await {
        let frame = match serde_json::to_vec(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping unencodable {:?} frame: {}", event.event_type, e);
                continue;
            }
        };
        if let Err(e) = sink.send(frame).await {
            warn!("failed to send {:?}: {}", event.event_type, e);
        }
    }
    debug!("edge events send queue closed");
}

async fn run_receiver(mut inbound: mpsc::Receiver<Vec<u8>>, subscriber: mpsc::UnboundedSender<ServerTrigger>) {
    while let Some(frame) = inbound.recv().await {
        match wire::decode_server_frame(&frame) {
            Ok(trigger) => {
                debug!("server event {}", trigger.name());
                if subscriber.send(trigger).is_err() {
                    debug!("trigger subscriber gone, stopping receive task");
                    break;
                }
            }
            Err(e) => warn!("dropping server frame: {}", e),
        }
    }
    debug!("edge events inbound stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryEndpoint;
    use crate::error::ProbeError;
    use crate::models::{AppPort, ClientIdentity};
    use crate::probe::TransportProbe;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct LoopbackTransport {
        connects: AtomicU32,
        sent: Arc<Mutex<Vec<ClientEdgeEvent>>>,
        server: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    }

    struct LoopbackSink {
        sent: Arc<Mutex<Vec<ClientEdgeEvent>>>,
    }

    #[async_trait]
    impl EventSink for LoopbackSink {
        async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
            let event = serde_json::from_slice(&frame).map_err(|e| ChannelError::Encode(e.to_string()))?;
            self.sent.lock().push(event);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl EventTransport for LoopbackTransport {
        async fn connect(&self, _endpoint: &EventEndpoint) -> Result<EventStream, ChannelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, inbound) = mpsc::channel(8);
            *self.server.lock() = Some(tx);
            Ok(EventStream { sink: Box::new(LoopbackSink { sent: self.sent.clone() }), inbound })
        }
    }

    struct Fixed;

    #[async_trait]
    impl TransportProbe for Fixed {
        async fn connect_test(&self, _host: &str, _port: u16) -> Result<f64, ProbeError> {
            Ok(30.0)
        }

        async fn ping_test(&self, _host: &str) -> Result<f64, ProbeError> {
            Ok(45.0)
        }
    }

    fn channel(
        registry: SessionRegistry,
    ) -> (EdgeEventsChannel, Arc<LoopbackTransport>, mpsc::UnboundedReceiver<ServerTrigger>) {
        let transport = Arc::new(LoopbackTransport::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = EdgeEventsChannel::new(
            transport.clone(),
            EventsConfig::default(),
            registry,
            LatencyTester::new(Arc::new(Fixed), 2),
            tx,
        );
        (channel, transport, rx)
    }

    fn session() -> SessionRegistry {
        let registry = SessionRegistry::new();
        registry.record_registration(
            ClientIdentity::new("Acme", "Game", "1.0"),
            "abc123".into(),
            DirectoryEndpoint::new("wifi.dme.edgelink.net", 38001),
        );
        let mut cloudlet = CloudletDescriptor::new("edge1.example.net", vec![AppPort::tcp(8008)], Location::new(37.33, -121.88));
        cloudlet.edge_events_cookie = Some("ee-1".into());
        registry.record_cloudlet(cloudlet);
        registry
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_open_without_cookies_never_connects() {
        let (channel, transport, _rx) = channel(SessionRegistry::new());
        let err = channel.open(DeviceInfoStatic::default(), DeviceInfoDynamic::default()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Setup(SetupError::MissingCookie(_))));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
        assert_eq!(channel.post_location_update(Location::new(1.0, 1.0), DeviceInfoDynamic::default()), Err(ChannelError::NotOpen));
    }

    #[tokio::test]
    async fn test_open_post_close_sequence() {
        let (channel, transport, _rx) = channel(session());
        channel.open(DeviceInfoStatic::default(), DeviceInfoDynamic::default()).await.unwrap();
        assert!(channel.post_location_update(Location::new(37.33, -121.88), DeviceInfoDynamic::default()).unwrap());

        let cloudlet = CloudletDescriptor::new("edge1.example.net", vec![AppPort::tcp(8008)], Location::new(0.0, 0.0));
        assert!(channel
            .test_and_post_latency_update(&cloudlet, 0, Location::new(37.33, -121.88), DeviceInfoDynamic::default())
            .await
            .unwrap());
        settle().await;
        channel.close().await;

        let kinds: Vec<_> = transport.sent.lock().iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                ClientEventType::InitConnection,
                ClientEventType::LocationUpdate,
                ClientEventType::LatencySamples,
                ClientEventType::TerminateConnection,
            ]
        );
        assert_eq!(transport.sent.lock()[2].samples.len(), 2);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_close_flushes_queued_frames() {
        let (channel, transport, _rx) = channel(session());
        channel.open(DeviceInfoStatic::default(), DeviceInfoDynamic::default()).await.unwrap();
        assert!(channel.post_location_update(Location::new(37.33, -121.88), DeviceInfoDynamic::default()).unwrap());
        // No yield: the send task has not run yet
        channel.close().await;

        let kinds: Vec<_> = transport.sent.lock().iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![ClientEventType::InitConnection, ClientEventType::LocationUpdate, ClientEventType::TerminateConnection]
        );
    }

    #[tokio::test]
    async fn test_pause_gates_only_telemetry() {
        let (channel, transport, mut rx) = channel(session());
        channel.open(DeviceInfoStatic::default(), DeviceInfoDynamic::default()).await.unwrap();
        channel.pause_sending_updates();

        assert!(!channel.post_location_update(Location::new(1.0, 1.0), DeviceInfoDynamic::default()).unwrap());
        let cloudlet = CloudletDescriptor::new("edge1.example.net", vec![AppPort::tcp(8008)], Location::new(0.0, 0.0));
        assert!(!channel
            .test_and_post_latency_update(&cloudlet, 0, Location::new(1.0, 1.0), DeviceInfoDynamic::default())
            .await
            .unwrap());

        // A server latency request is answered regardless
        assert!(channel
            .answer_latency_request(&cloudlet, 0, Location::new(1.0, 1.0), DeviceInfoDynamic::default())
            .await
            .unwrap());
        settle().await;
        let kinds: Vec<_> = transport.sent.lock().iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![ClientEventType::InitConnection, ClientEventType::LatencySamples]);

        // Receive path keeps flowing while paused
        let server = transport.server.lock().clone().unwrap();
        server.send(br#"{"event_type":"EVENT_LATENCY_REQUEST"}"#.to_vec()).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerTrigger::LatencyRequest));

        channel.resume_sending_updates();
        assert!(channel.post_location_update(Location::new(1.0, 1.0), DeviceInfoDynamic::default()).unwrap());
    }

    #[tokio::test]
    async fn test_receiver_skips_bad_frames_in_order() {
        let (channel, transport, mut rx) = channel(session());
        channel.open(DeviceInfoStatic::default(), DeviceInfoDynamic::default()).await.unwrap();
        let server = transport.server.lock().clone().unwrap();

        server.send(br#"{"event_type":"EVENT_INIT_CONNECTION"}"#.to_vec()).await.unwrap();
        server.send(br#"{"event_type":"EVENT_MYSTERY"}"#.to_vec()).await.unwrap();
        server.send(b"garbage".to_vec()).await.unwrap();
        server.send(br#"{"event_type":"EVENT_ERROR","error_msg":"boom"}"#.to_vec()).await.unwrap();

        assert_eq!(rx.recv().await, Some(ServerTrigger::InitConnection));
        assert_eq!(rx.recv().await, Some(ServerTrigger::Error("boom".into())));
    }
}
