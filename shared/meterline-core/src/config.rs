//! Configuration management for services

use crate::error::{MeterlineError, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub http_bind: String,
    pub log_level: String,
    pub json_logs: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "unknown".to_string()),
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            json_logs: env_or("JSON_LOGS", true)?,
        })
    }
}

/// Read and parse an environment variable, falling back to `default` when unset.
///
/// A variable that is set but fails to parse is a configuration error.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| MeterlineError::Config(format!("Invalid {}: {}", key, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default_when_unset() {
        let value: u64 = env_or("METERLINE_TEST_UNSET_VARIABLE", 5000).unwrap();
        assert_eq!(value, 5000);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        env::set_var("METERLINE_TEST_BAD_NUMBER", "five");
        let result: Result<u64> = env_or("METERLINE_TEST_BAD_NUMBER", 1);
        assert!(matches!(result, Err(MeterlineError::Config(_))));
        env::remove_var("METERLINE_TEST_BAD_NUMBER");
    }

    #[test]
    fn test_env_or_parses_bool() {
        env::set_var("METERLINE_TEST_BOOL", "false");
        let value: bool = env_or("METERLINE_TEST_BOOL", true).unwrap();
        assert!(!value);
        env::remove_var("METERLINE_TEST_BOOL");
    }
}
