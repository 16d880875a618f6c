//! Meterline Observability
//!
//! Structured logging setup and in-process metric primitives.

mod config;
mod metrics;
mod tracing_setup;

pub use config::ObservabilityConfig;
pub use metrics::{Counter, Gauge, Histogram, MetricSnapshot};
pub use tracing_setup::init_tracing;

/// Initialize logging for a service from the environment
pub fn init(service_name: &str) -> Result<(), ObservabilityError> {
    let config = ObservabilityConfig::from_env(service_name);
    init_tracing(&config)
}

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}
