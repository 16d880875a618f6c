//! Broadcast Hub
//!
//! Tracks live connections and their per-device subscriptions and fans each
//! published sample set out to the matching subscribers.
//!
//! Every connection owns one bounded outbound channel; its subscriptions all
//! deliver into it. `publish` snapshots the matching subscribers under a short
//! read lock, releases it, and then sends concurrently with a per-send timeout.
//! A subscriber whose channel is closed or stays full past the timeout has its
//! connection dropped; the publisher never sees the failure.

mod subscription;

pub use subscription::{EventReceiver, EventSender, SubscriptionHandle};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use meterline_core::{ConnectionId, DeviceId};
use meterline_observability::{Counter, Gauge, Histogram};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::TelemetryEvent;
use subscription::{DeliveryFailure, Subscriber};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("Hub is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound channel capacity per connection
    pub buffer: usize,
    /// Longest a single send may wait on a full channel
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            send_timeout: Duration::from_secs(1),
        }
    }
}

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub matched: usize,
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: u64,
    pub subscriptions: usize,
    pub published_total: u64,
    pub delivered_total: u64,
    pub dropped_total: u64,
    pub publish_mean_ms: f64,
    pub publish_p99_ms: f64,
}

struct Connection {
    sender: EventSender,
    subscriptions: HashMap<DeviceId, SubscriptionHandle>,
}

pub struct BroadcastHub {
    config: HubConfig,
    connections: DashMap<ConnectionId, Connection>,
    /// device -> connection -> subscriber
    routes: RwLock<HashMap<DeviceId, HashMap<ConnectionId, Arc<Subscriber>>>>,
    next_handle: AtomicU64,
    closed: AtomicBool,
    published: Counter,
    delivered: Counter,
    dropped: Counter,
    live_connections: Gauge,
    publish_latency_ms: Histogram,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            routes: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            published: Counter::new("hub_published_total"),
            delivered: Counter::new("hub_delivered_total"),
            dropped: Counter::new("hub_dropped_total"),
            live_connections: Gauge::new("hub_connections"),
            publish_latency_ms: Histogram::with_capacity("hub_publish_latency_ms", 1024),
        }
    }

    /// Register a live connection and return its outbound push channel
    pub fn connect(&self, connection_id: ConnectionId) -> Result<EventReceiver, HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Closed);
        }

        match self.connections.entry(connection_id.clone()) {
            Entry::Occupied(_) => Err(HubError::DuplicateConnection(connection_id)),
            Entry::Vacant(slot) => {
                let (sender, receiver) = mpsc::channel(self.config.buffer.max(1));
                slot.insert(Connection {
                    sender,
                    subscriptions: HashMap::new(),
                });
                self.live_connections.inc();
                debug!(connection_id = %connection_id, "Connection registered");
                Ok(receiver)
            }
        }
    }

    /// Register interest in a device. Idempotent per (connection, device).
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        device_id: &DeviceId,
    ) -> Result<SubscriptionHandle, HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Closed);
        }

        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))?;

        if let Some(existing) = connection.subscriptions.get(device_id) {
            return Ok(existing.clone());
        }

        let handle = SubscriptionHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            connection_id: connection_id.clone(),
            device_id: device_id.clone(),
        };
        let subscriber = Arc::new(Subscriber::new(handle.clone(), connection.sender.clone()));

        self.routes
            .write()
            .entry(device_id.clone())
            .or_default()
            .insert(connection_id.clone(), subscriber);
        connection
            .subscriptions
            .insert(device_id.clone(), handle.clone());

        debug!(connection_id = %connection_id, device_id = %device_id, "Subscribed");
        Ok(handle)
    }

    /// Remove one registration. Safe to call repeatedly; returns whether it was live.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match self.connections.get_mut(&handle.connection_id) {
            Some(mut connection) => {
                let current = connection
                    .subscriptions
                    .get(&handle.device_id)
                    .map(|h| h.id == handle.id)
                    .unwrap_or(false);
                if current {
                    connection.subscriptions.remove(&handle.device_id);
                    self.remove_route(&handle.device_id, &handle.connection_id, Some(handle.id));
                }
                current
            }
            None => false,
        };

        if removed {
            debug!(
                connection_id = %handle.connection_id,
                device_id = %handle.device_id,
                "Unsubscribed"
            );
        }
        removed
    }

    /// Drop a connection and all of its subscriptions, closing its channel.
    ///
    /// Returns the number of subscriptions removed.
    pub fn on_disconnect(&self, connection_id: &ConnectionId) -> usize {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return 0;
        };
        self.live_connections.dec();

        {
            let mut routes = self.routes.write();
            for device_id in connection.subscriptions.keys() {
                if let Some(targets) = routes.get_mut(device_id) {
                    targets.remove(connection_id);
                    if targets.is_empty() {
                        routes.remove(device_id);
                    }
                }
            }
        }

        let removed = connection.subscriptions.len();
        debug!(connection_id = %connection_id, removed, "Connection removed");
        removed
    }

    /// Deliver a sample set to every subscriber of its device.
    ///
    /// Per-device publish order is preserved for each subscriber as long as the
    /// caller publishes one device's events sequentially.
    pub async fn publish(&self, event: TelemetryEvent) -> PublishReport {
        if self.closed.load(Ordering::Acquire) {
            return PublishReport::default();
        }

        let started = Instant::now();
        let event = Arc::new(event);
        self.published.inc();

        let targets: Vec<Arc<Subscriber>> = self
            .routes
            .read()
            .get(&event.device_id)
            .map(|targets| targets.values().cloned().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            return PublishReport::default();
        }

        let send_timeout = self.config.send_timeout;
        let outcomes = join_all(targets.iter().map(|subscriber| {
            let event = Arc::clone(&event);
            async move {
                match tokio::time::timeout(send_timeout, subscriber.sender.send(event)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(DeliveryFailure::Closed),
                    Err(_) => Err(DeliveryFailure::TimedOut),
                }
            }
        }))
        .await;

        let mut report = PublishReport {
            matched: targets.len(),
            ..PublishReport::default()
        };

        for (subscriber, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    report.dropped += 1;
                    warn!(
                        connection_id = %subscriber.handle.connection_id,
                        device_id = %subscriber.handle.device_id,
                        reason = failure.as_str(),
                        "Dropping subscriber after failed delivery"
                    );
                    self.on_disconnect(&subscriber.handle.connection_id);
                }
            }
        }

        self.delivered.add(report.delivered as u64);
        self.dropped.add(report.dropped as u64);
        self.publish_latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0);

        report
    }

    /// Stop accepting connections and close every live channel
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let closing = self.connections.len();
        self.routes.write().clear();
        self.connections.clear();
        self.live_connections.set(0);
        info!(connections = closing, "Broadcast hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, device_id: &DeviceId) -> usize {
        self.routes.read().get(device_id).map(HashMap::len).unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.live_connections.get(),
            subscriptions: self.routes.read().values().map(HashMap::len).sum(),
            published_total: self.published.get(),
            delivered_total: self.delivered.get(),
            dropped_total: self.dropped.get(),
            publish_mean_ms: self.publish_latency_ms.mean(),
            publish_p99_ms: self.publish_latency_ms.percentile(99.0),
        }
    }

    fn remove_route(&self, device_id: &DeviceId, connection_id: &ConnectionId, handle_id: Option<u64>) {
        let mut routes = self.routes.write();
        if let Some(targets) = routes.get_mut(device_id) {
            let matches = targets
                .get(connection_id)
                .map(|s| handle_id.map_or(true, |id| s.handle.id == id))
                .unwrap_or(false);
            if matches {
                targets.remove(connection_id);
            }
            if targets.is_empty() {
                routes.remove(device_id);
            }
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event(device: &str, timestamp: i64) -> TelemetryEvent {
        let mut values = BTreeMap::new();
        values.insert("power".to_string(), timestamp as f64);
        TelemetryEvent {
            device_id: DeviceId::new(device),
            timestamp,
            values,
        }
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[tokio::test]
    async fn test_subscriber_receives_only_its_device() {
        let hub = BroadcastHub::default();
        let mut rx = hub.connect(conn("c1")).unwrap();
        hub.subscribe(&conn("c1"), &dev("power_meter")).unwrap();

        hub.publish(event("device_001", 1)).await;
        let report = hub.publish(event("power_meter", 2)).await;
        assert_eq!(report.delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.device_id, dev("power_meter"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let hub = BroadcastHub::default();
        let mut rx = hub.connect(conn("c1")).unwrap();
        let first = hub.subscribe(&conn("c1"), &dev("d")).unwrap();
        let second = hub.subscribe(&conn("c1"), &dev("d")).unwrap();
        assert_eq!(first, second);
        assert_eq!(hub.subscriber_count(&dev("d")), 1);

        hub.publish(event("d", 1)).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_safe() {
        let hub = BroadcastHub::default();
        let mut rx = hub.connect(conn("c1")).unwrap();
        let handle = hub.subscribe(&conn("c1"), &dev("d")).unwrap();

        assert!(hub.unsubscribe(&handle));
        assert!(!hub.unsubscribe(&handle));

        let report = hub.publish(event("d", 1)).await;
        assert_eq!(report.matched, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_remove_newer_subscription() {
        let hub = BroadcastHub::default();
        let _rx = hub.connect(conn("c1")).unwrap();
        let old = hub.subscribe(&conn("c1"), &dev("d")).unwrap();
        hub.unsubscribe(&old);
        let _new = hub.subscribe(&conn("c1"), &dev("d")).unwrap();

        assert!(!hub.unsubscribe(&old));
        assert_eq!(hub.subscriber_count(&dev("d")), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_every_subscription() {
        let hub = BroadcastHub::default();
        let mut rx = hub.connect(conn("c1")).unwrap();
        hub.subscribe(&conn("c1"), &dev("a")).unwrap();
        hub.subscribe(&conn("c1"), &dev("b")).unwrap();

        assert_eq!(hub.on_disconnect(&conn("c1")), 2);
        assert_eq!(hub.on_disconnect(&conn("c1")), 0);

        hub.publish(event("a", 1)).await;
        hub.publish(event("b", 2)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved_per_device() {
        let hub = BroadcastHub::default();
        let mut rx = hub.connect(conn("c1")).unwrap();
        hub.subscribe(&conn("c1"), &dev("d")).unwrap();

        for ts in 0..100 {
            hub.publish(event("d", ts)).await;
        }
        for ts in 0..100 {
            assert_eq!(rx.recv().await.unwrap().timestamp, ts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_is_dropped_without_blocking_others() {
        let hub = BroadcastHub::new(HubConfig {
            buffer: 1,
            send_timeout: Duration::from_millis(50),
        });
        let _stalled = hub.connect(conn("slow")).unwrap();
        let mut healthy = hub.connect(conn("fast")).unwrap();
        hub.subscribe(&conn("slow"), &dev("d")).unwrap();
        hub.subscribe(&conn("fast"), &dev("d")).unwrap();

        // First publish fills the slow channel; the second one times out on it.
        hub.publish(event("d", 1)).await;
        assert!(healthy.recv().await.is_some());
        let report = hub.publish(event("d", 2)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(healthy.recv().await.unwrap().timestamp, 2);
        assert_eq!(hub.subscriber_count(&dev("d")), 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_dropped() {
        let hub = BroadcastHub::default();
        let rx = hub.connect(conn("gone")).unwrap();
        hub.subscribe(&conn("gone"), &dev("d")).unwrap();
        drop(rx);

        let report = hub.publish(event("d", 1)).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.stats().dropped_total, 1);
    }

    #[tokio::test]
    async fn test_close_ends_every_channel() {
        let hub = BroadcastHub::default();
        let mut rx = hub.connect(conn("c1")).unwrap();
        hub.subscribe(&conn("c1"), &dev("d")).unwrap();

        hub.close();

        assert!(rx.recv().await.is_none());
        assert!(matches!(hub.connect(conn("c2")), Err(HubError::Closed)));
        assert!(matches!(
            hub.subscribe(&conn("c1"), &dev("d")),
            Err(HubError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_connections() {
        let hub = BroadcastHub::default();
        let _rx = hub.connect(conn("c1")).unwrap();
        assert!(matches!(
            hub.connect(conn("c1")),
            Err(HubError::DuplicateConnection(_))
        ));
        assert!(matches!(
            hub.subscribe(&conn("nobody"), &dev("d")),
            Err(HubError::UnknownConnection(_))
        ));
    }
}
