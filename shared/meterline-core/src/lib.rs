//! Meterline Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Standard service trait every Meterline service implements
//! - Common domain primitives (DeviceId, ConnectionId, timestamps)
//! - Error handling utilities
//! - Configuration management

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::ServiceConfig;
pub use domain::*;
pub use error::{MeterlineError, Result};
pub use service::{DependencyStatus, HealthStatus, MeterlineService, MicroserviceRuntime, ReadinessStatus};
