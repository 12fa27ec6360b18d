//! Physical transport for the edge-events stream
//!
//! `EventTransport::connect` yields a sink for outbound frames and an
//! ordered receiver of inbound frames. The MQTT implementation maps the
//! stream onto two topics per edge-events cookie:
//! - `{prefix}/{cookie}/client`: frames from the SDK
//! - `{prefix}/{cookie}/server`: frames from the server

use crate::config::EventsConfig;
use crate::error::ChannelError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const INBOUND_BUFFER: usize = 64;

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq)]
pub struct EventEndpoint {
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub client_id: String,
    pub edge_events_cookie: String,
}

impl EventEndpoint {
    /// Broker settings from config; an empty broker host falls back to
    /// `default_host` (the session's directory host).
    pub fn from_config(config: &EventsConfig, default_host: &str, client_id: String, edge_events_cookie: String) -> Self {
        let host = if config.broker_host.is_empty() { default_host.to_string() } else { config.broker_host.clone() };
        Self {
            host,
            port: config.broker_port,
            topic_prefix: config.topic_prefix.clone(),
            keep_alive_secs: config.keep_alive_secs,
            client_id,
            edge_events_cookie,
        }
    }

    pub fn client_topic(&self) -> String {
        format!("{}/{}/client", self.topic_prefix, topic_segment(&self.edge_events_cookie))
    }

    pub fn server_topic(&self) -> String {
        format!("{}/{}/server", self.topic_prefix, topic_segment(&self.edge_events_cookie))
    }
}

/// Cookies are opaque; MQTT separators and wildcards must not leak into topics.
pub fn topic_segment(cookie: &str) -> String {
    cookie
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c => c,
        })
        .collect()
}

/// Outbound half of a connected stream
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Tear the connection down; the inbound receiver closes afterwards.
    async fn close(&self);
}

pub struct EventStream {
    pub sink: Box<dyn EventSink>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self, endpoint: &EventEndpoint) -> Result<EventStream, ChannelError>;
}

/// rumqttc-backed transport
#[derive(Debug, Clone, Default)]
pub struct MqttEventTransport;

struct MqttSink {
    client: AsyncClient,
    topic: String,
}

#[async_trait]
impl EventSink for MqttSink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, false, frame)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("mqtt disconnect: {}", e);
        }
    }
}

#[async_trait]
impl EventTransport for MqttEventTransport {
    async fn connect(&self, endpoint: &EventEndpoint) -> Result<EventStream, ChannelError> {
        let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(endpoint.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let server_topic = endpoint.server_topic();
        client
            .subscribe(&server_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let (tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let topic = server_topic.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == topic => {
                        if tx.send(publish.payload.to_vec()).await.is_err() {
                            debug!("edge events receiver dropped, stopping mqtt loop");
                            break;
                        }
                    }
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        debug!("mqtt disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Disconnect or broker loss ends this open/close cycle
                        error!("edge events mqtt error: {}", e);
                        break;
                    }
                }
            }
        });

        info!("edge events connected to {}:{} on {}", endpoint.host, endpoint.port, server_topic);
        Ok(EventStream {
            sink: Box::new(MqttSink { client, topic: endpoint.client_topic() }),
            inbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_sanitize_cookie() {
        let endpoint = EventEndpoint::from_config(
            &EventsConfig::default(),
            "wifi.dme.edgelink.net",
            "edgelink-test".into(),
            "ab/c+d#".into(),
        );
        assert_eq!(endpoint.host, "wifi.dme.edgelink.net");
        assert_eq!(endpoint.client_topic(), "edgelink/events/ab_c_d_/client");
        assert_eq!(endpoint.server_topic(), "edgelink/events/ab_c_d_/server");
    }

    #[test]
    fn test_explicit_broker_host() {
        let config = EventsConfig { broker_host: "broker.local".into(), ..Default::default() };
        let endpoint = EventEndpoint::from_config(&config, "ignored", "id".into(), "c".into());
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 1883);
    }
}
