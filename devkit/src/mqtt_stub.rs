/*!
In-memory edge-events transport

Stands in for the MQTT broker: records every frame the SDK publishes and
lets tests push server frames into the open connection.
*/

use anyhow::Result;
use async_trait::async_trait;
use edgelink_sdk::channel::wire::{self, ClientEdgeEvent, ClientEventType, ServerEdgeEvent};
use edgelink_sdk::channel::{EventEndpoint, EventSink, EventStream, EventTransport};
use edgelink_sdk::directory::{DirectoryStatus, FindCloudletReply};
use edgelink_sdk::error::ChannelError;
use edgelink_sdk::models::{AppPort, LatencyStats, Location};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MockMessage {
    pub fn event(&self) -> Option<ClientEdgeEvent> {
        serde_json::from_slice(&self.payload).ok()
    }
}

type ServerSide = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// Mock transport implementing `EventTransport`
#[derive(Clone, Default)]
pub struct MockEventTransport {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    server: ServerSide,
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
}

struct MockSink {
    topic: String,
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    server: ServerSide,
}

#[async_trait]
impl EventSink for MockSink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        log::info!("📤 [MOCK] Published to {}: {} bytes", self.topic, frame.len());
        self.published_messages.lock().push(MockMessage { topic: self.topic.clone(), payload: frame });
        Ok(())
    }

    async fn close(&self) {
        // Dropping the server side closes the SDK's inbound stream
        self.server.lock().take();
        log::info!("🔌 [MOCK] Connection on {} closed", self.topic);
    }
}

#[async_trait]
impl EventTransport for MockEventTransport {
    async fn connect(&self, endpoint: &EventEndpoint) -> Result<EventStream, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            log::warn!("🚫 [MOCK] Refusing connection to {}", endpoint.host);
            return Err(ChannelError::Transport(format!("{}:{} refused", endpoint.host, endpoint.port)));
        }

        let (tx, inbound) = mpsc::channel(64);
        *self.server.lock() = Some(tx);
        self.subscriptions.lock().push(endpoint.server_topic());
        log::info!("📥 [MOCK] Subscribed to {}", endpoint.server_topic());

        Ok(EventStream {
            sink: Box::new(MockSink {
                topic: endpoint.client_topic(),
                published_messages: self.published_messages.clone(),
                server: self.server.clone(),
            }),
            inbound,
        })
    }
}

impl MockEventTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `connect` fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.server.lock().is_some()
    }

    /// Push a server frame into the open connection.
    pub async fn simulate_incoming(&self, event: &ServerEdgeEvent) -> Result<()> {
        self.simulate_raw(serde_json::to_vec(event)?).await?;
        log::info!("📨 [MOCK] Simulated incoming: {}", event.event_type);
        Ok(())
    }

    /// Push raw bytes, e.g. malformed frames.
    pub async fn simulate_raw(&self, payload: Vec<u8>) -> Result<()> {
        let sender = self.server.lock().clone();
        match sender {
            Some(sender) => sender.send(payload).await.map_err(|e| anyhow::anyhow!("Send error: {}", e)),
            None => anyhow::bail!("no open edge events connection"),
        }
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Decoded client frames, in publish order.
    pub fn published_events(&self) -> Vec<ClientEdgeEvent> {
        self.published_messages.lock().iter().filter_map(MockMessage::event).collect()
    }

    pub fn events_of(&self, kind: ClientEventType) -> Vec<ClientEdgeEvent> {
        self.published_events().into_iter().filter(|e| e.event_type == kind).collect()
    }

    pub fn count(&self, kind: ClientEventType) -> usize {
        self.events_of(kind).len()
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
        self.subscriptions.lock().clear();
    }
}

/// Builders for server frames
pub struct ServerEventBuilder;

impl ServerEventBuilder {
    /// FindCloudlet reply naming a replacement cloudlet
    pub fn found(fqdn: &str, port: u16, edge_events_cookie: &str) -> FindCloudletReply {
        FindCloudletReply {
            status: DirectoryStatus::Success,
            fqdn: fqdn.to_string(),
            ports: vec![AppPort::tcp(port)],
            cloudlet_location: Some(Location::new(37.4, -122.0)),
            cloudlet_name: None,
            edge_events_cookie: edge_events_cookie.to_string(),
        }
    }

    pub fn init_connection() -> ServerEdgeEvent {
        ServerEdgeEvent::new(wire::EVENT_INIT_CONNECTION)
    }

    pub fn appinst_health(status: &str, new_cloudlet: Option<FindCloudletReply>) -> ServerEdgeEvent {
        ServerEdgeEvent {
            health_check: Some(status.to_string()),
            new_cloudlet,
            ..ServerEdgeEvent::new(wire::EVENT_APPINST_HEALTH)
        }
    }

    pub fn cloudlet_maintenance(state: &str, new_cloudlet: Option<FindCloudletReply>) -> ServerEdgeEvent {
        ServerEdgeEvent {
            maintenance_state: Some(state.to_string()),
            new_cloudlet,
            ..ServerEdgeEvent::new(wire::EVENT_CLOUDLET_MAINTENANCE)
        }
    }

    pub fn cloudlet_state(state: &str, new_cloudlet: Option<FindCloudletReply>) -> ServerEdgeEvent {
        ServerEdgeEvent {
            cloudlet_state: Some(state.to_string()),
            new_cloudlet,
            ..ServerEdgeEvent::new(wire::EVENT_CLOUDLET_STATE)
        }
    }

    pub fn latency_request() -> ServerEdgeEvent {
        ServerEdgeEvent::new(wire::EVENT_LATENCY_REQUEST)
    }

    pub fn latency_processed(avg: f64) -> ServerEdgeEvent {
        ServerEdgeEvent {
            statistics: Some(LatencyStats {
                avg,
                min: avg,
                max: avg,
                std_dev: 0.0,
                variance: 0.0,
                num_samples: 5,
                timestamp: chrono::Utc::now(),
            }),
            ..ServerEdgeEvent::new(wire::EVENT_LATENCY_PROCESSED)
        }
    }

    pub fn cloudlet_update(new_cloudlet: Option<FindCloudletReply>) -> ServerEdgeEvent {
        ServerEdgeEvent { new_cloudlet, ..ServerEdgeEvent::new(wire::EVENT_CLOUDLET_UPDATE) }
    }

    pub fn error(message: &str) -> ServerEdgeEvent {
        ServerEdgeEvent { error_msg: Some(message.to_string()), ..ServerEdgeEvent::new(wire::EVENT_ERROR) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelink_sdk::config::EventsConfig;

    fn endpoint() -> EventEndpoint {
        EventEndpoint::from_config(&EventsConfig::default(), "wifi.dme.edgelink.net", "test".into(), "ee-1".into())
    }

    #[tokio::test]
    async fn test_mock_transport_roundtrip() {
        let transport = MockEventTransport::new();
        let mut stream = transport.connect(&endpoint()).await.unwrap();
        assert_eq!(transport.get_subscriptions(), vec!["edgelink/events/ee-1/server"]);

        stream.sink.send(b"{}".to_vec()).await.unwrap();
        let messages = transport.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "edgelink/events/ee-1/client");

        transport.simulate_incoming(&ServerEventBuilder::latency_request()).await.unwrap();
        let frame = stream.inbound.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&frame).contains("EVENT_LATENCY_REQUEST"));

        stream.sink.close().await;
        assert!(!transport.is_connected());
        assert!(stream.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let transport = MockEventTransport::new();
        transport.refuse_connections(true);
        assert!(transport.connect(&endpoint()).await.is_err());
        assert_eq!(transport.connect_count(), 1);
        assert!(transport.simulate_raw(b"x".to_vec()).await.is_err());
    }

    #[test]
    fn test_builders_classify() {
        let health = ServerEventBuilder::appinst_health("HEALTH_CHECK_FAIL", Some(ServerEventBuilder::found("edge2", 8008, "ee-2")));
        let trigger = health.classify().unwrap();
        assert_eq!(trigger.new_cloudlet().unwrap().fqdn, "edge2");
    }
}
