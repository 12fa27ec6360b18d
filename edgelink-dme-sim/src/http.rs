//! Directory REST API and admin routes
//!
//! - `/v1/registerclient`, `/v1/findcloudlet`, `/v1/getappinstlist`: the
//!   directory protocol spoken by the SDK
//! - `/admin/cloudlets/{name}/offline|online`: take a cloudlet out of
//!   service and tell affected sessions where to go
//! - `/admin/events/{cookie}`: push a raw server frame to one session

use crate::directory::Directory;
use crate::events::EventPublisher;
use crate::health::{HealthTracker, SimHealth};
use crate::state::Shared;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use edgelink_sdk::channel::wire::{ServerEdgeEvent, EVENT_CLOUDLET_STATE};
use edgelink_sdk::directory::{
    AppInstListReply, AppInstListRequest, FindCloudletReply, FindCloudletRequest, RegisterClientReply,
    RegisterClientRequest,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub directory: Shared<Directory>,
    pub health_tracker: HealthTracker,
    /// Absent when no broker is configured
    pub events: Option<EventPublisher>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown cloudlet {0}")]
    UnknownCloudlet(String),
    #[error("edge events are not available")]
    EventsUnavailable,
    #[error("failed to push event: {0}")]
    Push(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::UnknownCloudlet(_) => StatusCode::NOT_FOUND,
            ApiError::EventsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Push(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct OfflineReport {
    cloudlet: String,
    affected_sessions: usize,
    notified: usize,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/v1/registerclient", post(register_client))
        .route("/v1/findcloudlet", post(find_cloudlet))
        .route("/v1/getappinstlist", post(get_app_inst_list))
        .route("/admin/cloudlets/{name}/offline", post(take_offline))
        .route("/admin/cloudlets/{name}/online", post(bring_online))
        .route("/admin/events/{cookie}", post(push_event))
        .with_state(app_state)
}

async fn get_system_health(State(app): State<AppState>) -> Json<SimHealth> {
    Json(app.health_tracker.get_health(&app.directory))
}

async fn register_client(
    State(app): State<AppState>,
    Json(request): Json<RegisterClientRequest>,
) -> Json<RegisterClientReply> {
    Json(app.directory.lock().register(&request))
}

async fn find_cloudlet(State(app): State<AppState>, Json(request): Json<FindCloudletRequest>) -> Json<FindCloudletReply> {
    Json(app.directory.lock().find_cloudlet(&request))
}

async fn get_app_inst_list(
    State(app): State<AppState>,
    Json(request): Json<AppInstListRequest>,
) -> Json<AppInstListReply> {
    Json(app.directory.lock().get_app_inst_list(&request))
}

async fn take_offline(State(app): State<AppState>, Path(name): Path<String>) -> Result<Json<OfflineReport>, ApiError> {
    let affected = {
        let mut dir = app.directory.lock();
        if !dir.knows_cloudlet(&name) {
            return Err(ApiError::UnknownCloudlet(name));
        }
        dir.take_offline(&name)
    };
    info!("cloudlet {name} offline, {} sessions affected", affected.len());

    let mut notified = 0;
    if let Some(events) = &app.events {
        for (cookie, replacement) in &affected {
            let mut event = ServerEdgeEvent {
                cloudlet_state: Some("CLOUDLET_STATE_OFFLINE".into()),
                ..ServerEdgeEvent::new(EVENT_CLOUDLET_STATE)
            };
            if let Some(reply) = replacement {
                event = event.with_new_cloudlet(reply.clone());
            }
            match events.push(cookie, &event).await {
                Ok(()) => notified += 1,
                Err(e) => warn!("failed to notify session: {e}"),
            }
        }
    }

    Ok(Json(OfflineReport { cloudlet: name, affected_sessions: affected.len(), notified }))
}

async fn bring_online(State(app): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    let mut dir = app.directory.lock();
    if !dir.knows_cloudlet(&name) {
        return Err(ApiError::UnknownCloudlet(name));
    }
    dir.bring_online(&name);
    info!("cloudlet {name} back online");
    Ok(StatusCode::NO_CONTENT)
}

async fn push_event(
    State(app): State<AppState>,
    Path(cookie): Path<String>,
    Json(event): Json<ServerEdgeEvent>,
) -> Result<StatusCode, ApiError> {
    let events = app.events.as_ref().ok_or(ApiError::EventsUnavailable)?;
    events.push(&cookie, &event).await?;
    info!("pushed {} to session", event.event_type);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::state::new_state;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use edgelink_sdk::directory::DirectoryStatus;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn app() -> Router {
        build_router(AppState {
            directory: new_state(Directory::new(SimConfig::default())),
            health_tracker: HealthTracker::new(),
            events: None,
        })
    }

    async fn post_json<T: DeserializeOwned>(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, T) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn register(app: &Router) -> String {
        let (status, reply): (_, RegisterClientReply) = post_json(
            app,
            "/v1/registerclient",
            json!({"ver": 1, "org_name": "Acme", "app_name": "Game", "app_vers": "1.0", "carrier_name": ""}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply.status, DirectoryStatus::Success);
        reply.session_cookie
    }

    #[tokio::test]
    async fn test_register_then_find() {
        let app = app();
        let cookie = register(&app).await;

        let (_, reply): (_, FindCloudletReply) = post_json(
            &app,
            "/v1/findcloudlet",
            json!({"ver": 1, "session_cookie": cookie, "carrier_name": "", "gps_location": {"latitude": 37.33, "longitude": -121.88}}),
        )
        .await;
        assert_eq!(reply.status, DirectoryStatus::Success);
        assert_eq!(reply.fqdn, "edge1.example.net");
        assert!(!reply.edge_events_cookie.is_empty());

        let (_, list): (_, AppInstListReply) = post_json(
            &app,
            "/v1/getappinstlist",
            json!({"ver": 1, "session_cookie": cookie, "carrier_name": "", "gps_location": {"latitude": 37.33, "longitude": -121.88}, "limit": 5}),
        )
        .await;
        assert_eq!(list.cloudlets.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_cloudlet_and_health() {
        let app = app();
        let cookie = register(&app).await;
        let find = json!({"ver": 1, "session_cookie": cookie, "carrier_name": "", "gps_location": {"latitude": 37.33, "longitude": -121.88}});
        let _: (_, FindCloudletReply) = post_json(&app, "/v1/findcloudlet", find.clone()).await;

        let (status, report): (_, serde_json::Value) = post_json(&app, "/admin/cloudlets/sanjose/offline", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["affected_sessions"], 1);
        assert_eq!(report["notified"], 0);

        let (_, reply): (_, FindCloudletReply) = post_json(&app, "/v1/findcloudlet", find).await;
        assert_eq!(reply.fqdn, "edge2.example.net");

        let (status, _): (_, serde_json::Value) = post_json(&app, "/admin/cloudlets/atlantis/offline", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/system/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: SimHealth = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health.sessions, 1);
        assert_eq!(health.edge_sessions, 3);
    }

    #[tokio::test]
    async fn test_push_without_broker() {
        let app = app();
        let (status, body): (_, serde_json::Value) =
            post_json(&app, "/admin/events/ee-1", json!({"event_type": "EVENT_LATENCY_REQUEST"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not available"));
    }
}
