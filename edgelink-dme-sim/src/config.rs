use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub http_port: u16,
    pub mqtt: MqttConf,
    /// Registered applications; empty accepts any app
    pub apps: Vec<AppConf>,
    pub cloudlets: Vec<CloudletConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConf {
    pub org_name: String,
    pub app_name: String,
    pub app_vers: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CloudletConf {
    pub name: String,
    pub fqdn: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
}

fn default_ports() -> Vec<u16> {
    vec![8008]
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, topic_prefix: "edgelink/events".into() }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            http_port: 38001,
            mqtt: MqttConf::default(),
            apps: Vec::new(),
            cloudlets: vec![
                CloudletConf {
                    name: "sanjose".into(),
                    fqdn: "edge1.example.net".into(),
                    latitude: 37.3382,
                    longitude: -121.8863,
                    ports: default_ports(),
                },
                CloudletConf {
                    name: "paloalto".into(),
                    fqdn: "edge2.example.net".into(),
                    latitude: 37.4419,
                    longitude: -122.1430,
                    ports: default_ports(),
                },
            ],
        }
    }
}

pub async fn load_config() -> SimConfig {
    let path = std::env::var("DME_SIM_CONFIG").unwrap_or_else(|_| "dme-sim.yaml".into());
    if !Path::new(&path).exists() {
        warn!("no {path}, using default catalogue");
        return SimConfig::default();
    }
    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return SimConfig::default();
    }
    match serde_yaml::from_str::<SimConfig>(&txt) {
        Ok(cfg) => {
            info!("loaded {} cloudlets from {path}", cfg.cloudlets.len());
            cfg
        }
        Err(e) => {
            warn!("invalid config {path}: {e}");
            SimConfig::default()
        }
    }
}
