//! REST API handlers

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meterline_core::{now_millis, DeviceId, MeterlineError, TimestampMs};
use meterline_observability::MetricSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{error, info};

use super::AppState;
use crate::domain::{Device, TelemetryValue};
use crate::error::GatewayError;
use crate::generator::IngestReport;
use crate::hub::HubStats;
use crate::query::{
    DeviceKeys, EntityMapping, EntityTelemetry, KeyMapping, LatestTelemetry, TimeseriesQuery,
    TimeseriesResult,
};
use crate::store::{Aggregation, StoreStats};

/// Default lookback when a timeseries request omits `startTs`
const DEFAULT_LOOKBACK_MS: i64 = 60 * 60 * 1000;

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            message: Some(message.into()),
        })
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Error rendered as a failed envelope with the matching status code
#[derive(Debug)]
pub struct ApiError(pub MeterlineError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err.into())
    }
}

impl From<MeterlineError> for ApiError {
    fn from(err: MeterlineError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(MeterlineError::Validation(format!(
            "Invalid request format: {}",
            rejection.body_text()
        )))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = match &self.0 {
            MeterlineError::Internal(_) => {
                error!(error = %self.0, "Internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, ApiResponse::<()>::error(message)).into_response()
    }
}

// ============================================
// Health & System
// ============================================

pub async fn banner(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": "Meterline Telemetry Gateway",
        "service": state.service_name,
        "version": state.version,
        "endpoints": {
            "api": "/api/v1",
            "websocket": "/ws",
            "health": "/health",
        },
    }))
}

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

pub async fn ready_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let ingesting = !state.ingestor.is_closed();
    let streaming = !state.hub.is_closed();
    let status = if ingesting && streaming {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "ready": ingesting && streaming,
            "ingestor": ingesting,
            "hub": streaming,
        })),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub status: &'static str,
    /// Unix seconds
    pub timestamp: i64,
    pub service: String,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub connected_clients: usize,
    pub devices: usize,
    pub ingested_total: u64,
    pub dropped_keys_total: u64,
    pub store: StoreStats,
    pub hub: HubStats,
    pub metrics: Vec<MetricSnapshot>,
}

pub async fn system_status(State(state): State<AppState>) -> Json<ApiResponse<SystemStatus>> {
    ApiResponse::success(SystemStatus {
        status: if state.ingestor.is_closed() { "stopping" } else { "running" },
        timestamp: now_millis() / 1000,
        service: state.service_name.clone(),
        version: state.version,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connected_clients: state.hub.connection_count(),
        devices: state.query.registry().len(),
        ingested_total: state.ingestor.ingested_total(),
        dropped_keys_total: state.ingestor.dropped_keys_total(),
        store: state.store.stats(),
        hub: state.hub.stats(),
        metrics: state.ingestor.metrics(),
    })
}

// ============================================
// Devices
// ============================================

pub async fn list_devices(State(state): State<AppState>) -> Json<ApiResponse<Vec<Device>>> {
    ApiResponse::success(state.query.list_devices())
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Device> {
    Ok(ApiResponse::success(state.query.get_device(&DeviceId::new(id))?))
}

pub async fn get_device_keys(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeviceKeys> {
    Ok(ApiResponse::success(state.query.key_schema(&DeviceId::new(id))?))
}

pub async fn get_latest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<LatestTelemetry> {
    Ok(ApiResponse::success(state.query.get_latest(&DeviceId::new(id))?))
}

/// Externally pushed sample set
#[derive(Debug, Deserialize)]
pub struct PushTelemetryRequest {
    #[serde(default, alias = "timestamp")]
    pub ts: Option<TimestampMs>,
    pub values: BTreeMap<String, TelemetryValue>,
}

pub async fn push_telemetry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PushTelemetryRequest>, JsonRejection>,
) -> ApiResult<IngestReport> {
    let Json(req) = body?;
    let device_id = DeviceId::new(id);
    let values = req
        .values
        .into_iter()
        .map(|(key, value)| (key, value.as_f64()))
        .collect();

    let report = state.ingestor.ingest(&device_id, req.ts, values).await?;
    info!(
        device_id = %device_id,
        accepted = report.accepted.len(),
        dropped = report.dropped.len(),
        "Telemetry pushed"
    );
    Ok(ApiResponse::success(report))
}

// ============================================
// History
// ============================================

/// Wire shape of a timeseries request; zero or absent fields take defaults
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesRequest {
    pub device_id: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub start_ts: TimestampMs,
    #[serde(default)]
    pub end_ts: TimestampMs,
    /// Bucket width in ms; 0 returns raw samples
    #[serde(default, alias = "intervalMs")]
    pub interval: i64,
    #[serde(default)]
    pub agg: Option<String>,
}

impl TimeseriesRequest {
    fn into_query(self, now: TimestampMs) -> Result<TimeseriesQuery, ApiError> {
        let agg = match self.agg.as_deref() {
            Some(raw) => Aggregation::from_str(raw).map_err(MeterlineError::Validation)?,
            None => Aggregation::default(),
        };

        let end_ts = if self.end_ts == 0 { now } else { self.end_ts };
        let start_ts = if self.start_ts == 0 {
            end_ts.saturating_sub(DEFAULT_LOOKBACK_MS)
        } else {
            self.start_ts
        };

        Ok(TimeseriesQuery {
            device_id: self.device_id,
            keys: self.keys,
            start_ts,
            end_ts,
            interval_ms: (self.interval != 0).then_some(self.interval),
            agg,
        })
    }
}

pub async fn query_timeseries(
    State(state): State<AppState>,
    body: Result<Json<TimeseriesRequest>, JsonRejection>,
) -> ApiResult<TimeseriesResult> {
    let Json(req) = body?;
    let query = req.into_query(now_millis())?;
    Ok(ApiResponse::success(state.query.query_timeseries(query)?))
}

// ============================================
// Mappings
// ============================================

pub async fn key_mappings(State(state): State<AppState>) -> Json<ApiResponse<Vec<KeyMapping>>> {
    ApiResponse::success(state.query.key_mappings())
}

pub async fn entity_mappings(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<EntityMapping>>> {
    ApiResponse::success(state.query.entity_mappings())
}

pub async fn entity_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<EntityTelemetry> {
    Ok(ApiResponse::success(state.query.entity_data(&DeviceId::new(id))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: serde_json::Value) -> TimeseriesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_timeseries_defaults() {
        let query = request(json!({"deviceId": "power_meter", "keys": ["power"]}))
            .into_query(10_000_000)
            .unwrap();
        assert_eq!(query.start_ts, 10_000_000 - DEFAULT_LOOKBACK_MS);
        assert_eq!(query.end_ts, 10_000_000);
        assert_eq!(query.interval_ms, None);
        assert_eq!(query.agg, Aggregation::Avg);
    }

    #[test]
    fn test_missing_start_looks_back_from_explicit_end() {
        let end = 1_700_000_000_000;
        let query = request(json!({"deviceId": "power_meter", "keys": ["power"], "endTs": end}))
            .into_query(end + 5 * DEFAULT_LOOKBACK_MS)
            .unwrap();
        assert_eq!(query.start_ts, end - DEFAULT_LOOKBACK_MS);
        assert_eq!(query.end_ts, end);
    }

    #[test]
    fn test_timeseries_interval_and_agg() {
        let query = request(json!({
            "deviceId": "power_meter",
            "keys": ["power"],
            "startTs": 1,
            "endTs": 2,
            "interval": 60000,
            "agg": "max"
        }))
        .into_query(0)
        .unwrap();
        assert_eq!(query.interval_ms, Some(60_000));
        assert_eq!(query.agg, Aggregation::Max);

        let err = request(json!({"deviceId": "power_meter", "keys": ["power"], "agg": "median"}))
            .into_query(0)
            .unwrap_err();
        assert_eq!(err.0.status_code(), 400);
    }

    #[test]
    fn test_error_envelope() {
        let response = ApiError::from(GatewayError::DeviceNotFound(DeviceId::new("x"))).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(MeterlineError::Internal("boom".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = ApiError::from(GatewayError::ShuttingDown).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
