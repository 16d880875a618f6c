//! API module - REST and WebSocket

pub mod rest;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::generator::TelemetryIngestor;
use crate::hub::BroadcastHub;
use crate::query::QueryService;
use crate::store::TimeSeriesStore;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub ingestor: Arc<TelemetryIngestor>,
    pub hub: Arc<BroadcastHub>,
    pub store: Arc<TimeSeriesStore>,
    pub service_name: String,
    pub version: &'static str,
    pub started_at: Instant,
    pub cors_enabled: bool,
}

pub fn create_router(state: AppState) -> Router {
    let cors_enabled = state.cors_enabled;

    let router = Router::new()
        // Health & system
        .route("/", get(rest::banner))
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::ready_check))
        .route("/api/v1/system/status", get(rest::system_status))
        // Devices
        .route("/api/v1/telemetry/devices", get(rest::list_devices))
        .route("/api/v1/telemetry/devices/{id}", get(rest::get_device))
        .route("/api/v1/telemetry/devices/{id}/keys", get(rest::get_device_keys))
        .route("/api/v1/telemetry/devices/{id}/latest", get(rest::get_latest))
        .route("/api/v1/telemetry/devices/{id}/telemetry", post(rest::push_telemetry))
        .route("/api/v1/telemetry/latest/{id}", get(rest::get_latest))
        // History
        .route("/api/v1/telemetry/timeseries", post(rest::query_timeseries))
        // Mappings
        .route("/api/v1/telemetry/keys/mappings", get(rest::key_mappings))
        .route("/api/v1/telemetry/entities/mappings", get(rest::entity_mappings))
        .route("/api/v1/telemetry/entities/{id}/data", get(rest::entity_data))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        .with_state(state);

    if cors_enabled {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    }
}
