//! Error types for Meterline services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeterlineError>;

#[derive(Error, Debug)]
pub enum MeterlineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl MeterlineError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Unavailable(_) => 503,
            Self::Timeout(_) => 504,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Delivery(_) => "DELIVERY_ERROR",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Timeout(_) => "TIMEOUT",
        }
    }
}

impl From<std::io::Error> for MeterlineError {
    fn from(err: std::io::Error) -> Self {
        MeterlineError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(MeterlineError::Validation("x".into()).status_code(), 400);
        assert_eq!(MeterlineError::NotFound("x".into()).status_code(), 404);
        assert_eq!(MeterlineError::Internal("x".into()).status_code(), 500);
        assert_eq!(MeterlineError::Unavailable("x".into()).status_code(), 503);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MeterlineError::NotFound("d".into()).error_code(), "NOT_FOUND");
        assert_eq!(
            MeterlineError::Validation("d".into()).error_code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_io_error_maps_to_network() {
        let err: MeterlineError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use").into();
        assert_eq!(err.error_code(), "NETWORK_ERROR");
    }
}
