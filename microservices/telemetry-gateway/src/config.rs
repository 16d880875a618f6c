//! Gateway configuration

use meterline_core::config::env_or;
use meterline_core::{DeviceId, MeterlineError, Result, ServiceConfig};
use std::collections::HashMap;
use std::time::Duration;

use crate::store::RetentionPolicy;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub service: ServiceConfig,
    /// Default generator cadence
    pub tick_interval: Duration,
    /// Per-device cadence overrides
    pub tick_overrides: HashMap<DeviceId, Duration>,
    pub simulation_enabled: bool,
    pub simulation_seed: u64,
    pub retention: RetentionPolicy,
    /// Outbound channel capacity per live connection
    pub subscriber_buffer: usize,
    /// Per-send timeout before a subscriber is dropped
    pub send_timeout: Duration,
    pub cors_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                service_name: "telemetry-gateway".to_string(),
                http_bind: "0.0.0.0:8080".to_string(),
                log_level: "info".to_string(),
                json_logs: true,
            },
            tick_interval: Duration::from_secs(5),
            tick_overrides: HashMap::new(),
            simulation_enabled: true,
            simulation_seed: 42,
            retention: RetentionPolicy::default(),
            subscriber_buffer: 256,
            send_timeout: Duration::from_millis(1000),
            cors_enabled: true,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let mut service = ServiceConfig::from_env()?;
        if service.service_name == "unknown" {
            service.service_name = "telemetry-gateway".to_string();
        }

        let tick_ms: u64 = env_or("TICK_INTERVAL_MS", 5000)?;
        if tick_ms == 0 {
            return Err(MeterlineError::Config("TICK_INTERVAL_MS must be > 0".to_string()));
        }

        let max_samples: usize = env_or("RETENTION_MAX_SAMPLES", 1000)?;
        let max_age_secs: u64 = env_or("RETENTION_MAX_AGE_SECS", 0)?;

        let subscriber_buffer: usize = env_or("SUBSCRIBER_BUFFER", 256)?;
        if subscriber_buffer == 0 {
            return Err(MeterlineError::Config("SUBSCRIBER_BUFFER must be > 0".to_string()));
        }

        Ok(Self {
            service,
            tick_interval: Duration::from_millis(tick_ms),
            tick_overrides: parse_overrides(
                &std::env::var("TICK_INTERVAL_OVERRIDES").unwrap_or_default(),
            )?,
            simulation_enabled: env_or("SIMULATION_ENABLED", true)?,
            simulation_seed: env_or("SIMULATION_SEED", 42)?,
            retention: RetentionPolicy {
                max_samples: (max_samples > 0).then_some(max_samples),
                max_age_ms: (max_age_secs > 0).then(|| max_age_secs as i64 * 1000),
            },
            subscriber_buffer,
            send_timeout: Duration::from_millis(env_or("SEND_TIMEOUT_MS", 1000)?),
            cors_enabled: env_or("CORS_ENABLED", true)?,
        })
    }

    /// Cadence for a device, honoring overrides
    pub fn tick_interval_for(&self, device_id: &DeviceId) -> Duration {
        self.tick_overrides
            .get(device_id)
            .copied()
            .unwrap_or(self.tick_interval)
    }
}

/// Parse `id=ms,id=ms` cadence overrides
pub fn parse_overrides(raw: &str) -> Result<HashMap<DeviceId, Duration>> {
    let mut overrides = HashMap::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, ms) = entry.split_once('=').ok_or_else(|| {
            MeterlineError::Config(format!("Invalid tick override '{}', expected id=ms", entry))
        })?;
        let ms: u64 = ms.trim().parse().map_err(|e| {
            MeterlineError::Config(format!("Invalid tick override '{}': {}", entry, e))
        })?;
        if ms == 0 {
            return Err(MeterlineError::Config(format!(
                "Tick override for '{}' must be > 0",
                id.trim()
            )));
        }
        overrides.insert(DeviceId::new(id.trim()), Duration::from_millis(ms));
    }

    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let overrides = parse_overrides("power_meter=1000, device_001=2500").unwrap();
        assert_eq!(overrides.len(), 2);
        assert_eq!(
            overrides[&DeviceId::new("power_meter")],
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_parse_overrides_empty() {
        assert!(parse_overrides("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_overrides_rejects_zero_and_garbage() {
        assert!(parse_overrides("power_meter=0").is_err());
        assert!(parse_overrides("power_meter").is_err());
        assert!(parse_overrides("power_meter=fast").is_err());
    }

    #[test]
    fn test_tick_interval_for_falls_back_to_default() {
        let mut config = GatewayConfig::default();
        config
            .tick_overrides
            .insert(DeviceId::new("power_meter"), Duration::from_secs(1));

        assert_eq!(
            config.tick_interval_for(&DeviceId::new("power_meter")),
            Duration::from_secs(1)
        );
        assert_eq!(
            config.tick_interval_for(&DeviceId::new("device_001")),
            Duration::from_secs(5)
        );
    }
}
