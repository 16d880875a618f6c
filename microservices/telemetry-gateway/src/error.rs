//! Gateway error taxonomy

use meterline_core::{DeviceId, MeterlineError};

use crate::hub::HubError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Telemetry key '{key}' not declared for device {device_id}")]
    KeyNotFound { device_id: DeviceId, key: String },

    #[error("No telemetry recorded yet for device {0}")]
    NoTelemetry(DeviceId),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => GatewayError::Validation(msg),
            StoreError::Internal(msg) => GatewayError::Internal(msg),
        }
    }
}

impl From<HubError> for GatewayError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Closed => GatewayError::ShuttingDown,
            other => GatewayError::Delivery(other.to_string()),
        }
    }
}

impl From<GatewayError> for MeterlineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Validation(msg) => MeterlineError::Validation(msg),
            GatewayError::DeviceNotFound(_)
            | GatewayError::KeyNotFound { .. }
            | GatewayError::NoTelemetry(_) => MeterlineError::NotFound(err.to_string()),
            GatewayError::Delivery(msg) => MeterlineError::Delivery(msg),
            GatewayError::Internal(msg) => MeterlineError::Internal(msg),
            GatewayError::ShuttingDown => MeterlineError::Unavailable(err.to_string()),
        }
    }
}
