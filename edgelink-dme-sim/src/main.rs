//! EdgeLink DME simulator - local directory and edge-events service
//!
//! Serves the directory REST protocol from a static cloudlet catalogue and
//! answers edge-events frames over MQTT, so the SDK and agent can be run
//! end to end without a real operator backend.

mod config;
mod directory;
mod events;
mod health;
mod http;
mod state;

use crate::config::load_config;
use crate::directory::Directory;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::state::new_state;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgelink_dme_sim=info")))
        .init();

    let cfg = load_config().await;
    let directory = new_state(Directory::new(cfg.clone()));
    let health_tracker = HealthTracker::new();

    let events = events::spawn_responder(&cfg.mqtt, directory.clone(), health_tracker.clone());

    let app = http::build_router(AppState { directory, health_tracker, events: Some(events) });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!("listening on http://{addr}");
    let listener = TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
