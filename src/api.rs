// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP surface (spec §6.1): a thin axum router over `CameraRegistry` and
//! `StreamProber`. The REST framework itself is out of scope — this is
//! the minimal shim the core needs to actually serve the MJPEG body
//! `PreviewPublisher` owns and to expose the named registry operations.
//!
//! Endpoints:
//!   GET    /api/cameras                   → enumerate
//!   POST   /api/cameras                   → create
//!   PUT    /api/cameras/{id}               → reload
//!   DELETE /api/cameras/{id}               → remove
//!   POST   /api/cameras/{id}/start          → start
//!   POST   /api/cameras/{id}/stop           → stop
//!   POST   /api/cameras/{id}/show          → show
//!   POST   /api/cameras/{id}/hide          → hide
//!   GET    /api/cameras/{id}/mjpeg         → subscribe_preview
//!   GET    /api/cameras/{id}/status        → status + state + debug record
//!   POST   /api/probe                      → one-shot StreamProber::probe

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::config::{CameraSpec, RegistryOverride};
use crate::error::CoreError;
use crate::probe::StreamProber;
use crate::registry::CameraRegistry;
use crate::status_store::StatusStore;

pub struct AppState {
    pub registry: Arc<CameraRegistry>,
    pub status_store: Arc<dyn StatusStore>,
    pub prober: Arc<StreamProber>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/cameras", get(handle_enumerate).post(handle_create))
        .route(
            "/api/cameras/{id}",
            get(handle_get).put(handle_reload).delete(handle_remove),
        )
        .route("/api/cameras/{id}/start", post(handle_start))
        .route("/api/cameras/{id}/stop", post(handle_stop))
        .route("/api/cameras/{id}/show", post(handle_show))
        .route("/api/cameras/{id}/hide", post(handle_hide))
        .route("/api/cameras/{id}/mjpeg", get(handle_mjpeg))
        .route("/api/probe", post(handle_probe))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(port, "HTTP API listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

fn error_response(err: CoreError) -> axum::response::Response {
    let status = match &err {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::AlreadyExists { .. } => StatusCode::CONFLICT,
        CoreError::PreviewDisabled { .. } => StatusCode::CONFLICT,
        CoreError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Config(_) => StatusCode::BAD_REQUEST,
        CoreError::Classified { code, .. } => match code {
            crate::error::ErrorCode::InvalidSpec => StatusCode::BAD_REQUEST,
            crate::error::ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            crate::error::ErrorCode::PreviewDisabled => StatusCode::CONFLICT,
            crate::error::ErrorCode::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        },
        CoreError::Decoder(_) | CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, axum::Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct CreateCameraRequest {
    #[serde(flatten)]
    spec: CameraSpec,
    #[serde(default)]
    registry_override: RegistryOverrideBody,
}

#[derive(Deserialize, Default)]
struct RegistryOverrideBody {
    transport_preference: Option<crate::config::TransportPreference>,
    resolution: Option<crate::config::Resolution>,
    extra_decoder_flags: Option<String>,
}

impl From<RegistryOverrideBody> for RegistryOverride {
    fn from(body: RegistryOverrideBody) -> Self {
        RegistryOverride {
            transport_preference: body.transport_preference,
            resolution: body.resolution,
            extra_decoder_flags: body.extra_decoder_flags,
        }
    }
}

#[derive(Serialize)]
struct CameraSummaryResponse {
    id: String,
    mode: &'static str,
    running: bool,
    hidden: bool,
    phase: Option<&'static str>,
}

async fn handle_enumerate(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summaries = state.registry.enumerate().await;
    let out: Vec<CameraSummaryResponse> = summaries
        .into_iter()
        .map(|s| CameraSummaryResponse {
            id: s.id,
            mode: mode_str(s.mode),
            running: s.running,
            hidden: s.hidden,
            phase: s.phase.map(|p| p.as_str()),
        })
        .collect();
    axum::Json(serde_json::json!({ "cameras": out }))
}

async fn handle_create(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateCameraRequest>,
) -> axum::response::Response {
    match state.registry.create(body.spec, body.registry_override.into()).await {
        Ok(()) => (StatusCode::CREATED, axum::Json(serde_json::json!({ "status": "created" }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_reload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    axum::Json(mut body): axum::Json<CreateCameraRequest>,
) -> axum::response::Response {
    body.spec.id = id;
    match state.registry.reload(body.spec, body.registry_override.into()).await {
        Ok(()) => axum::Json(serde_json::json!({ "status": "reloaded" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_remove(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.registry.remove(&id).await {
        Ok(()) => axum::Json(serde_json::json!({ "status": "removed" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_start(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.registry.start(&id).await {
        Ok(()) => axum::Json(serde_json::json!({ "status": "started" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_stop(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.registry.stop(&id).await {
        Ok(()) => axum::Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_show(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.registry.show(&id).await {
        Ok(()) => axum::Json(serde_json::json!({ "status": "shown" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_hide(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.registry.hide(&id).await {
        Ok(()) => axum::Json(serde_json::json!({ "status": "hidden" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_get(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    let state_json = state.status_store.get_state(&id);
    let status_json = state.status_store.get_status(&id);
    let debug_json = state.status_store.get_debug(&id);
    if state_json.is_none() && status_json.is_none() && debug_json.is_none() {
        return error_response(CoreError::NotFound { id });
    }
    axum::Json(serde_json::json!({
        "state": state_json,
        "status": status_json,
        "debug": debug_json,
    }))
    .into_response()
}

async fn handle_mjpeg(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    let publisher = match state.registry.preview(&id).await {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    match publisher.subscribe() {
        Ok(stream) => axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", crate::preview::PreviewPublisher::content_type())
            .body(Body::from_stream(stream))
            .unwrap(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ProbeRequest {
    uri: String,
    #[serde(default)]
    use_fallback: bool,
}

async fn handle_probe(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<ProbeRequest>,
) -> axum::response::Response {
    match state.prober.probe(&body.uri, body.use_fallback).await {
        Ok(result) => axum::Json(serde_json::json!({
            "codec": result.codec,
            "width": result.width,
            "height": result.height,
            "pixel_format": result.pixel_format,
            "nominal_fps": result.nominal_fps,
            "avg_frame_rate": result.avg_frame_rate,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            axum::Json(serde_json::json!({ "error": e.reason, "code": e.code.as_str() })),
        )
            .into_response(),
    }
}

fn mode_str(mode: crate::config::CameraMode) -> &'static str {
    match mode {
        crate::config::CameraMode::Rtsp => "rtsp",
        crate::config::CameraMode::Http => "http",
        crate::config::CameraMode::Local => "local",
    }
}
