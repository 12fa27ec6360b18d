//! Edge-events responder
//!
//! Listens on `{prefix}/+/client` and answers on the matching
//! `{prefix}/{cookie}/server` topic:
//! - init connection is acknowledged, or refused for an unknown cookie
//! - latency samples come back as processed statistics
//! - a location update closer to another cloudlet yields a cloudlet update

use crate::config::MqttConf;
use crate::directory::Directory;
use crate::health::HealthTracker;
use crate::state::Shared;
use edgelink_sdk::channel::transport::topic_segment;
use edgelink_sdk::channel::wire::{
    ClientEdgeEvent, ClientEventType, ServerEdgeEvent, EVENT_ERROR, EVENT_INIT_CONNECTION, EVENT_LATENCY_PROCESSED,
    EVENT_CLOUDLET_UPDATE,
};
use edgelink_sdk::LatencyStats;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task;
use tracing::{debug, error, info, warn};

fn error_event(msg: impl Into<String>) -> ServerEdgeEvent {
    ServerEdgeEvent { error_msg: Some(msg.into()), ..ServerEdgeEvent::new(EVENT_ERROR) }
}

/// Reply, if any, to one client frame.
pub fn respond(directory: &mut Directory, event: ClientEdgeEvent) -> Option<ServerEdgeEvent> {
    if event.event_type == ClientEventType::TerminateConnection {
        directory.end_edge_session(&event.edge_events_cookie);
        return None;
    }

    let known = directory
        .edge_session(&event.edge_events_cookie)
        .is_some_and(|s| s.session_cookie == event.session_cookie);
    if !known {
        warn!("frame {:?} for unknown edge session", event.event_type);
        return Some(error_event("unknown edge events cookie"));
    }

    match event.event_type {
        ClientEventType::InitConnection => {
            if let Some(device) = &event.device_info_static {
                info!("edge session opened from {} ({})", device.device_model, device.device_os);
            }
            Some(ServerEdgeEvent::new(EVENT_INIT_CONNECTION))
        }
        ClientEventType::LatencySamples => {
            let stats = LatencyStats::from_samples(&event.samples)?;
            debug!("latency avg {:.1}ms over {} samples", stats.avg, stats.num_samples);
            Some(ServerEdgeEvent { statistics: Some(stats), ..ServerEdgeEvent::new(EVENT_LATENCY_PROCESSED) })
        }
        ClientEventType::LocationUpdate => {
            let location = event.gps_location?;
            let reply = directory.closer_cloudlet(&event.edge_events_cookie, &location)?;
            Some(ServerEdgeEvent::new(EVENT_CLOUDLET_UPDATE).with_new_cloudlet(reply))
        }
        ClientEventType::TerminateConnection => None,
    }
}

/// `{prefix}/{segment}/client` → `{prefix}/{segment}/server`
fn reply_topic(prefix: &str, topic: &str) -> Option<String> {
    let segment = topic.strip_prefix(prefix)?.strip_prefix('/')?.strip_suffix("/client")?;
    (!segment.is_empty() && !segment.contains('/')).then(|| format!("{prefix}/{segment}/server"))
}

/// Pushes server-originated frames to a session's topic
#[derive(Clone)]
pub struct EventPublisher {
    client: AsyncClient,
    prefix: String,
}

impl EventPublisher {
    pub async fn push(&self, edge_events_cookie: &str, event: &ServerEdgeEvent) -> anyhow::Result<()> {
        let topic = format!("{}/{}/server", self.prefix, topic_segment(edge_events_cookie));
        let payload = serde_json::to_vec(event)?;
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

fn handle_publish(client: &AsyncClient, prefix: &str, directory: &Shared<Directory>, topic: &str, payload: &[u8]) {
    let Some(reply_to) = reply_topic(prefix, topic) else {
        debug!("ignoring publish on {topic}");
        return;
    };
    let event = match serde_json::from_slice::<ClientEdgeEvent>(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("invalid client frame on {topic}: {e}");
            return;
        }
    };
    let Some(reply) = respond(&mut directory.lock(), event) else {
        return;
    };
    match serde_json::to_vec(&reply) {
        // try_publish: the event loop that drains the request queue is the caller
        Ok(bytes) => {
            if let Err(e) = client.try_publish(reply_to, QoS::AtLeastOnce, false, bytes) {
                error!("failed to publish {}: {e:?}", reply.event_type);
            }
        }
        Err(e) => error!("failed to encode {}: {e}", reply.event_type),
    }
}

pub fn spawn_responder(conf: &MqttConf, directory: Shared<Directory>, health: HealthTracker) -> EventPublisher {
    let mut opts = MqttOptions::new(format!("edgelink-dme-sim-{}", uuid::Uuid::new_v4()), &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    let prefix = conf.topic_prefix.clone();
    let publisher = EventPublisher { client: client.clone(), prefix: prefix.clone() };
    let filter = format!("{prefix}/+/client");

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    info!("broker connected, listening on {filter}");
                    if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        error!("subscribe {filter} failed: {e:?}");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    handle_publish(&client, &prefix, &directory, &p.topic, &p.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {e:?}");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    publisher
}
