//! Telemetry Generator / Ingestor
//!
//! Every sample set, simulated or pushed, goes through [`TelemetryIngestor::ingest`]:
//! validate against the registry, write atomically to the store, then queue the
//! same timestamped set for the hub. Each device has one ordered publish queue
//! drained by its own task, so store order and live-stream order agree while a
//! slow subscriber never holds up the next write.

mod simulator;
mod supervisor;

pub use simulator::{DeviceSimulator, ReadingSource};
pub use supervisor::TickSupervisor;

use meterline_core::{now_millis, DeviceId, TimestampMs};
use meterline_observability::{Counter, MetricSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::domain::TelemetryEvent;
use crate::error::GatewayError;
use crate::hub::BroadcastHub;
use crate::registry::DeviceRegistry;
use crate::store::TimeSeriesStore;

/// Events a device may have waiting for delivery before writers wait too
const PUBLISH_QUEUE: usize = 1024;

/// Result of one accepted sample set
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub device_id: DeviceId,
    pub timestamp: TimestampMs,
    pub accepted: Vec<String>,
    pub dropped: Vec<String>,
    /// Live subscribers of the device when the set was queued
    pub subscribers: usize,
}

/// Write path of one device plus its publish queue
#[derive(Default)]
struct DeviceLane {
    publisher: Option<Publisher>,
}

struct Publisher {
    queue: mpsc::Sender<TelemetryEvent>,
    handle: JoinHandle<()>,
}

impl DeviceLane {
    /// Publish queue for this device, spawning its drain task on first use
    fn queue(&mut self, device_id: &DeviceId, hub: &Arc<BroadcastHub>) -> &mpsc::Sender<TelemetryEvent> {
        if self.publisher.as_ref().is_some_and(|p| p.queue.is_closed()) {
            self.publisher = None;
        }
        &self
            .publisher
            .get_or_insert_with(|| {
                let (queue, rx) = mpsc::channel(PUBLISH_QUEUE);
                let handle = tokio::spawn(run_publisher(device_id.clone(), Arc::clone(hub), rx));
                Publisher { queue, handle }
            })
            .queue
    }
}

/// Deliver one device's events to the hub in queue order
async fn run_publisher(
    device_id: DeviceId,
    hub: Arc<BroadcastHub>,
    mut queue: mpsc::Receiver<TelemetryEvent>,
) {
    while let Some(event) = queue.recv().await {
        let timestamp = event.timestamp;
        let report = hub.publish(event).await;
        if report.dropped > 0 {
            debug!(
                device_id = %device_id,
                timestamp,
                dropped = report.dropped,
                "Subscribers dropped during publish"
            );
        }
    }
    debug!(device_id = %device_id, "Publish queue drained");
}

pub struct TelemetryIngestor {
    registry: Arc<DeviceRegistry>,
    store: Arc<TimeSeriesStore>,
    hub: Arc<BroadcastHub>,
    /// Serializes write+enqueue per device
    lanes: HashMap<DeviceId, Mutex<DeviceLane>>,
    closed: AtomicBool,
    ingested: Counter,
    dropped_keys: Counter,
}

impl TelemetryIngestor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<TimeSeriesStore>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        let lanes = registry
            .list()
            .iter()
            .map(|device| (device.id.clone(), Mutex::new(DeviceLane::default())))
            .collect();

        Self {
            registry,
            store,
            hub,
            lanes,
            closed: AtomicBool::new(false),
            ingested: Counter::new("ingested_sets_total"),
            dropped_keys: Counter::new("ingest_dropped_keys_total"),
        }
    }

    /// Validate, store and queue one sample set for publishing.
    ///
    /// Unknown or non-finite keys are dropped with a warning. The set is rejected
    /// when the device is unknown or no key survives validation. `timestamp`
    /// defaults to the current wall clock; the same value is stored and published.
    /// Returns once the set is stored and queued, without waiting on subscribers.
    pub async fn ingest(
        &self,
        device_id: &DeviceId,
        timestamp: Option<TimestampMs>,
        values: BTreeMap<String, f64>,
    ) -> Result<IngestReport, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ShuttingDown);
        }

        let device = self.registry.get(device_id)?;
        let lane = self
            .lanes
            .get(device_id)
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.clone()))?;

        let mut accepted = BTreeMap::new();
        let mut dropped = Vec::new();
        for (key, value) in values {
            if !device.has_key(&key) {
                warn!(device_id = %device_id, key = %key, "Dropping undeclared telemetry key");
                dropped.push(key);
            } else if !value.is_finite() {
                warn!(device_id = %device_id, key = %key, value, "Dropping non-finite telemetry value");
                dropped.push(key);
            } else {
                accepted.insert(key, value);
            }
        }
        self.dropped_keys.add(dropped.len() as u64);

        if accepted.is_empty() {
            return Err(GatewayError::Validation(format!(
                "No declared telemetry keys in sample set for device {}",
                device_id
            )));
        }

        let mut lane = lane.lock().await;
        // Shutdown may have begun while waiting for the device lane.
        if self.is_closed() {
            return Err(GatewayError::ShuttingDown);
        }

        let timestamp = timestamp.unwrap_or_else(now_millis);
        if let Err(e) = self.store.write_batch(device_id, timestamp, &accepted) {
            error!(device_id = %device_id, timestamp, error = %e, "Store write failed; not publishing");
            return Err(e.into());
        }

        let keys: Vec<String> = accepted.keys().cloned().collect();
        let subscribers = self.hub.subscriber_count(device_id);
        let event = TelemetryEvent {
            device_id: device_id.clone(),
            timestamp,
            values: accepted,
        };
        if lane.queue(device_id, &self.hub).send(event).await.is_err() {
            warn!(device_id = %device_id, timestamp, "Publish queue closed; set stored but not pushed");
        }
        drop(lane);

        self.ingested.inc();
        debug!(
            device_id = %device_id,
            timestamp,
            keys = keys.len(),
            subscribers,
            "Sample set ingested"
        );

        Ok(IngestReport {
            device_id: device_id.clone(),
            timestamp,
            accepted: keys,
            dropped,
            subscribers,
        })
    }

    /// Wait until every queued set has been handed to the hub.
    ///
    /// Publish tasks are wound down; the next ingest for a device starts a new
    /// one. Returns how many tasks were drained.
    pub async fn drain_publishers(&self) -> usize {
        let mut drained = 0;
        for (device_id, lane) in &self.lanes {
            let publisher = lane.lock().await.publisher.take();
            let Some(Publisher { queue, handle }) = publisher else {
                continue;
            };
            drop(queue);
            if let Err(e) = handle.await {
                warn!(device_id = %device_id, error = %e, "Publish task ended abnormally");
            }
            drained += 1;
        }
        drained
    }

    /// Reject all further ingestion
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ingested_total(&self) -> u64 {
        self.ingested.get()
    }

    pub fn dropped_keys_total(&self) -> u64 {
        self.dropped_keys.get()
    }

    pub fn metrics(&self) -> Vec<MetricSnapshot> {
        vec![(&self.ingested).into(), (&self.dropped_keys).into()]
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::store::RetentionPolicy;
    use meterline_core::ConnectionId;
    use std::time::Duration;

    fn ingestor() -> (TelemetryIngestor, Arc<TimeSeriesStore>, Arc<BroadcastHub>) {
        let registry = Arc::new(DeviceRegistry::builtin());
        let store = Arc::new(TimeSeriesStore::new(RetentionPolicy::unbounded()));
        let hub = Arc::new(BroadcastHub::default());
        let ingestor = TelemetryIngestor::new(registry, Arc::clone(&store), Arc::clone(&hub));
        (ingestor, store, hub)
    }

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_store_and_broadcast_share_timestamp() {
        let (ingestor, store, hub) = ingestor();
        let meter = DeviceId::new("power_meter");
        let mut rx = hub.connect(ConnectionId::from("c1")).unwrap();
        hub.subscribe(&ConnectionId::from("c1"), &meter).unwrap();

        let report = ingestor
            .ingest(&meter, None, values(&[("voltage", 221.0), ("current", 4.0)]))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timestamp, report.timestamp);
        assert_eq!(store.latest(&meter)["voltage"].timestamp, report.timestamp);
        assert_eq!(report.subscribers, 1);
    }

    #[tokio::test]
    async fn test_unknown_keys_are_dropped_not_fatal() {
        let (ingestor, store, _hub) = ingestor();
        let meter = DeviceId::new("power_meter");

        let report = ingestor
            .ingest(&meter, Some(1_000), values(&[("voltage", 220.0), ("humidity", 40.0)]))
            .await
            .unwrap();

        assert_eq!(report.accepted, vec!["voltage"]);
        assert_eq!(report.dropped, vec!["humidity"]);
        assert!(!store.latest(&meter).contains_key("humidity"));
        assert_eq!(ingestor.dropped_keys_total(), 1);
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let (ingestor, _store, _hub) = ingestor();
        let err = ingestor
            .ingest(&DeviceId::new("ghost"), None, values(&[("voltage", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_without_valid_keys_writes_and_publishes_nothing() {
        let (ingestor, store, hub) = ingestor();
        let meter = DeviceId::new("power_meter");
        let mut rx = hub.connect(ConnectionId::from("c1")).unwrap();
        hub.subscribe(&ConnectionId::from("c1"), &meter).unwrap();

        let err = ingestor
            .ingest(&meter, None, values(&[("voltage", f64::INFINITY)]))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(store.latest(&meter).is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_ingestor_rejects_writes() {
        let (ingestor, store, _hub) = ingestor();
        ingestor.close();

        let err = ingestor
            .ingest(&DeviceId::new("power_meter"), None, values(&[("voltage", 220.0)]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ShuttingDown));
        assert_eq!(store.stats().writes_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_does_not_hold_up_writes() {
        let store = Arc::new(TimeSeriesStore::new(RetentionPolicy::unbounded()));
        let hub = Arc::new(BroadcastHub::new(HubConfig {
            buffer: 1,
            send_timeout: Duration::from_secs(1),
        }));
        let ingestor = TelemetryIngestor::new(
            Arc::new(DeviceRegistry::builtin()),
            Arc::clone(&store),
            Arc::clone(&hub),
        );
        let meter = DeviceId::new("power_meter");

        let _stalled = hub.connect(ConnectionId::from("stalled")).unwrap();
        hub.subscribe(&ConnectionId::from("stalled"), &meter).unwrap();
        let mut healthy = hub.connect(ConnectionId::from("healthy")).unwrap();
        hub.subscribe(&ConnectionId::from("healthy"), &meter).unwrap();

        for ts in [1_000, 2_000, 3_000] {
            tokio::time::timeout(
                Duration::from_millis(100),
                ingestor.ingest(&meter, Some(ts), values(&[("voltage", 220.0)])),
            )
            .await
            .expect("write waited on a subscriber")
            .unwrap();
        }
        assert_eq!(store.series_len(&meter, "voltage"), 3);

        // Delivery order survives; the stalled connection is dropped on timeout.
        for ts in [1_000, 2_000, 3_000] {
            assert_eq!(healthy.recv().await.unwrap().timestamp, ts);
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_publishers_flushes_queued_sets() {
        let (ingestor, _store, hub) = ingestor();
        let meter = DeviceId::new("power_meter");
        let mut rx = hub.connect(ConnectionId::from("c1")).unwrap();
        hub.subscribe(&ConnectionId::from("c1"), &meter).unwrap();

        for ts in 1..=5 {
            ingestor
                .ingest(&meter, Some(ts), values(&[("voltage", 220.0)]))
                .await
                .unwrap();
        }
        assert_eq!(ingestor.drain_publishers().await, 1);
        assert_eq!(ingestor.drain_publishers().await, 0);

        hub.close();
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.timestamp);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
