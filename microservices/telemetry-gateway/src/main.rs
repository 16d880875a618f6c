//! Telemetry Gateway
//!
//! Device telemetry backend with:
//! - Simulated per-device readings on a fixed cadence
//! - Push ingestion over HTTP
//! - Bounded in-memory time-series store with ranged/aggregated queries
//! - Live WebSocket fan-out filtered per device

use meterline_core::{MeterlineError, MicroserviceRuntime, Result};
use std::sync::Arc;
use tracing::info;

use telemetry_gateway::{GatewayConfig, TelemetryGateway};

#[tokio::main]
async fn main() -> Result<()> {
    meterline_observability::init("telemetry-gateway")
        .map_err(|e| MeterlineError::Config(e.to_string()))?;

    info!("Starting Telemetry Gateway");

    let config = GatewayConfig::from_env()?;
    let service = Arc::new(TelemetryGateway::new(config));
    MicroserviceRuntime::run(service).await
}
