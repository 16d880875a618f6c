//! Telemetry Gateway
//!
//! Components are constructed explicitly and shared by `Arc`:
//!
//! - [`DeviceRegistry`]: read-only device catalog
//! - [`TimeSeriesStore`]: bounded per-device, per-key series
//! - [`TelemetryIngestor`] + [`TickSupervisor`]: one cancellable tick task per
//!   device; every sample set is written atomically, then queued for publishing
//! - [`BroadcastHub`]: per-device fan-out to live connections
//! - [`QueryService`]: latest / range / aggregate reads
//!
//! [`TelemetryGateway`] wires them together and serves HTTP + WebSocket.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod generator;
pub mod hub;
pub mod query;
pub mod registry;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::GatewayConfig;
pub use domain::{Device, KeyKind, Sample, TelemetryEvent, TelemetryKey, TelemetryValue};
pub use error::GatewayError;
pub use generator::{DeviceSimulator, IngestReport, ReadingSource, TelemetryIngestor, TickSupervisor};
pub use hub::{BroadcastHub, HubConfig, HubError, PublishReport, SubscriptionHandle};
pub use query::{LatestTelemetry, QueryService, TimeseriesQuery, TimeseriesResult};
pub use registry::DeviceRegistry;
pub use store::{Aggregation, RetentionPolicy, StoreError, TimeSeriesStore};

use axum::Router;
use meterline_core::{
    DependencyStatus, HealthStatus, MeterlineService, ReadinessStatus, Result,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::info;

pub struct TelemetryGateway {
    config: GatewayConfig,
    registry: Arc<DeviceRegistry>,
    store: Arc<TimeSeriesStore>,
    hub: Arc<BroadcastHub>,
    ingestor: Arc<TelemetryIngestor>,
    supervisor: TickSupervisor,
    query: QueryService,
    start_time: Instant,
    http_shutdown: Arc<Notify>,
}

impl TelemetryGateway {
    /// Gateway over the built-in device catalog
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_registry(config, DeviceRegistry::builtin())
    }

    pub fn with_registry(config: GatewayConfig, registry: DeviceRegistry) -> Self {
        let registry = Arc::new(registry);
        let store = Arc::new(TimeSeriesStore::new(config.retention));
        let hub = Arc::new(BroadcastHub::new(HubConfig {
            buffer: config.subscriber_buffer,
            send_timeout: config.send_timeout,
        }));
        let ingestor = Arc::new(TelemetryIngestor::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&hub),
        ));
        let supervisor = TickSupervisor::new(Arc::clone(&ingestor));
        let query = QueryService::new(Arc::clone(&registry), Arc::clone(&store));

        Self {
            config,
            registry,
            store,
            hub,
            ingestor,
            supervisor,
            query,
            start_time: Instant::now(),
            http_shutdown: Arc::new(Notify::new()),
        }
    }

    /// Start one simulated tick task per registered device; returns how many started
    pub fn start_simulation(&self) -> usize {
        let started = self
            .registry
            .list()
            .into_iter()
            .filter(|device| {
                let period = self.config.tick_interval_for(&device.id);
                let source = DeviceSimulator::new(Arc::clone(device), self.config.simulation_seed);
                self.supervisor
                    .start_device(device.id.clone(), period, Box::new(source))
            })
            .count();

        info!(
            devices = started,
            default_tick_ms = self.config.tick_interval.as_millis() as u64,
            "Simulation started"
        );
        started
    }

    pub fn app_state(&self) -> api::AppState {
        api::AppState {
            query: self.query.clone(),
            ingestor: Arc::clone(&self.ingestor),
            hub: Arc::clone(&self.hub),
            store: Arc::clone(&self.store),
            service_name: self.config.service.service_name.clone(),
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.start_time,
            cors_enabled: self.config.cors_enabled,
        }
    }

    pub fn router(&self) -> Router {
        api::create_router(self.app_state())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn ingestor(&self) -> &Arc<TelemetryIngestor> {
        &self.ingestor
    }

    pub fn supervisor(&self) -> &TickSupervisor {
        &self.supervisor
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }
}

#[async_trait::async_trait]
impl MeterlineService for TelemetryGateway {
    fn service_id(&self) -> &'static str {
        "telemetry-gateway"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: !self.ingestor.is_closed(),
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let ingesting = !self.ingestor.is_closed();
        let streaming = !self.hub.is_closed();

        ReadinessStatus {
            ready: ingesting && streaming,
            dependencies: vec![
                DependencyStatus {
                    name: "ingestor".to_string(),
                    available: ingesting,
                    latency_ms: None,
                },
                DependencyStatus {
                    name: "broadcast-hub".to_string(),
                    available: streaming,
                    latency_ms: None,
                },
            ],
        }
    }

    /// Ordered teardown: no writes, no ticks, flush queued pushes, no subscribers, then HTTP
    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down Telemetry Gateway");

        self.ingestor.close();
        let stopped = self.supervisor.stop_all().await;
        let drained = self.ingestor.drain_publishers().await;
        self.hub.close();
        self.http_shutdown.notify_one();

        info!(tick_tasks = stopped, publish_queues = drained, "Telemetry Gateway stopped");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.config.simulation_enabled {
            self.start_simulation();
        }

        info!(http = %self.config.service.http_bind, "Starting Telemetry Gateway server");

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.service.http_bind).await?;
        let http_shutdown = Arc::clone(&self.http_shutdown);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.notified().await })
            .await?;

        Ok(())
    }
}
