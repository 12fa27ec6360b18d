//! EdgeLink Agent - headless host for the EdgeLink SDK
//!
//! The agent keeps one application session on the best edge cloudlet:
//! - Registers with the directory service (carrier host, wifi fallback)
//! - Finds a cloudlet in proximity or performance mode
//! - Runs edge events and follows server-driven migrations
//! - Logs every upgrade and failure it is told about

mod config;
mod netinfo;

use anyhow::{Context, Result};
use config::AgentConfig;
use edgelink_sdk::{
    CloudletResolver, EdgeEventsManager, HostCallbacks, HttpDirectoryClient, LatencyTester, MqttEventTransport, NetProbe,
    SessionRegistry, StaticLocation,
};
use netinfo::HostDevice;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Host callbacks: the agent only reports what happened
fn host_callbacks() -> HostCallbacks {
    HostCallbacks::new()
        .on_connection_upgrade(|upgrade| {
            if upgrade.migrated {
                info!("🔀 Now connected to {} ({})", upgrade.cloudlet.fqdn, upgrade.trigger.name());
            } else {
                info!("📌 Better cloudlet available: {} ({})", upgrade.cloudlet.fqdn, upgrade.trigger.name());
            }
        })
        .on_connection_failure(|failure| {
            if failure.reason.is_hard_failure() {
                error!("❌ Edge events failure: {}", failure);
            } else {
                info!("Staying on current cloudlet: {}", failure);
            }
        })
}

struct Agent {
    config: AgentConfig,
    manager: EdgeEventsManager,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<Self> {
        info!("Initializing EdgeLink Agent v{}", env!("CARGO_PKG_VERSION"));

        let device = Arc::new(HostDevice::new(config.device.clone()));
        let location = Arc::new(StaticLocation(config.device.location()));
        let directory =
            Arc::new(HttpDirectoryClient::new(&config.directory).context("Failed to build directory client")?);
        let probe = Arc::new(NetProbe::new(config.edge_events.probe_timeout()));

        let resolver = CloudletResolver::new(
            directory,
            config.directory.clone(),
            SessionRegistry::new(),
            location.clone(),
            device.clone(),
            LatencyTester::new(probe, config.edge_events.samples_per_test),
        )
        .with_default_location(config.edge_events.default_location.clone())
        .with_latency_test_port(config.edge_events.latency_test_port);

        let manager = EdgeEventsManager::new(
            config.edge_events.clone(),
            config.events.clone(),
            Arc::new(resolver),
            Arc::new(MqttEventTransport),
            location,
            device,
        );
        Ok(Self { config, manager })
    }

    async fn run(&self) -> Result<()> {
        let identity = self.config.app.identity();
        info!("Registering {}/{} v{}", identity.org_name, identity.app_name, identity.app_vers);

        let cloudlet = self
            .manager
            .resolver()
            .register_and_find_cloudlet(identity, self.config.dme_host(), self.config.dme_port, self.config.find_mode)
            .await
            .context("Failed to find a cloudlet")?;
        info!("📍 Using cloudlet {} ({} ports)", cloudlet.fqdn, cloudlet.ports.len());

        self.manager.start(host_callbacks()).await.context("Failed to start edge events")?;
        info!("✅ Edge events running, press Ctrl+C to stop");

        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Shutting down...");
        self.manager.stop().await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgelink_agent=info,edgelink_sdk=info")),
        )
        .init();

    info!("🛰️ EdgeLink Agent starting...");

    let config = match std::env::args().nth(1) {
        Some(path) => AgentConfig::load_from(Path::new(&path)).await,
        None => AgentConfig::load().await,
    }
    .context("Failed to load agent configuration")?;

    let agent = Agent::new(config).context("Failed to create agent")?;
    agent.run().await.context("Agent execution failed")?;
    Ok(())
}
