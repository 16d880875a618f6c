//! Cross-component scenarios

use meterline_core::{ConnectionId, DeviceId, MeterlineService};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    Aggregation, GatewayConfig, GatewayError, ReadingSource, RetentionPolicy, TelemetryGateway,
    TimeseriesQuery,
};

fn gateway() -> TelemetryGateway {
    let config = GatewayConfig {
        simulation_enabled: false,
        retention: RetentionPolicy::unbounded(),
        ..GatewayConfig::default()
    };
    TelemetryGateway::new(config)
}

fn meter_reading() -> BTreeMap<String, f64> {
    [
        ("voltage", 220.0),
        ("current", 5.0),
        ("power", 1.1),
        ("energy", 0.02),
        ("cost", 500.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Emits a rising voltage, one step per tick
struct Scripted {
    tick: i64,
}

impl ReadingSource for Scripted {
    fn next_reading(&mut self, _now: i64) -> BTreeMap<String, f64> {
        self.tick += 1;
        let mut values = BTreeMap::new();
        values.insert("voltage".to_string(), 220.0 + self.tick as f64);
        values
    }
}

#[tokio::test]
async fn test_power_meter_tick_is_visible_and_pushed() {
    let gateway = gateway();
    let meter = DeviceId::new("power_meter");
    let conn = ConnectionId::from("dashboard");

    let mut events = gateway.hub().connect(conn.clone()).unwrap();
    gateway.hub().subscribe(&conn, &meter).unwrap();

    let report = gateway
        .ingestor()
        .ingest(&meter, None, meter_reading())
        .await
        .unwrap();

    let latest = gateway.query().get_latest(&meter).unwrap();
    assert_eq!(latest.values, meter_reading());
    assert_eq!(latest.timestamp, report.timestamp);
    assert!(latest.samples.values().all(|s| s.timestamp == report.timestamp));

    let pushed = events.recv().await.unwrap();
    assert_eq!(pushed.device_id, meter);
    assert_eq!(pushed.timestamp, report.timestamp);
    assert_eq!(pushed.values, meter_reading());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_n_ticks_yield_n_samples() {
    let gateway = gateway();
    let meter = DeviceId::new("device_003");

    for ts in 1..=25 {
        let mut values = BTreeMap::new();
        values.insert("voltage".to_string(), 230.0);
        gateway.ingestor().ingest(&meter, Some(ts * 1_000), values).await.unwrap();
    }

    let result = gateway
        .query()
        .query_timeseries(TimeseriesQuery {
            device_id: "device_003".to_string(),
            keys: vec!["voltage".to_string()],
            start_ts: 0,
            end_ts: 100_000,
            interval_ms: None,
            agg: Aggregation::Avg,
        })
        .unwrap();
    assert_eq!(result.data["voltage"].len(), 25);

    // Constant series aggregates to the constant in every bucket.
    let result = gateway
        .query()
        .query_timeseries(TimeseriesQuery {
            device_id: "device_003".to_string(),
            keys: vec!["voltage".to_string()],
            start_ts: 0,
            end_ts: 30_000,
            interval_ms: Some(7_000),
            agg: Aggregation::Avg,
        })
        .unwrap();
    assert_eq!(result.data["voltage"].len(), 4);
    assert!(result.data["voltage"].iter().all(|&(_, v)| v == 230.0));
}

#[tokio::test]
async fn test_disconnected_subscriber_receives_nothing() {
    let gateway = gateway();
    let meter = DeviceId::new("power_meter");
    let conn = ConnectionId::from("gone");

    let mut events = gateway.hub().connect(conn.clone()).unwrap();
    gateway.hub().subscribe(&conn, &meter).unwrap();
    assert_eq!(gateway.hub().on_disconnect(&conn), 1);

    let report = gateway
        .ingestor()
        .ingest(&meter, None, meter_reading())
        .await
        .unwrap();

    assert_eq!(report.subscribers, 0);
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_subscriber_only_sees_its_device() {
    let gateway = gateway();
    let conn = ConnectionId::from("c1");
    let mut events = gateway.hub().connect(conn.clone()).unwrap();
    gateway.hub().subscribe(&conn, &DeviceId::new("device_001")).unwrap();

    for ts in [1_000, 2_000, 3_000] {
        let mut temp = BTreeMap::new();
        temp.insert("temperature".to_string(), ts as f64 / 100.0);
        gateway
            .ingestor()
            .ingest(&DeviceId::new("device_001"), Some(ts), temp)
            .await
            .unwrap();
        gateway
            .ingestor()
            .ingest(&DeviceId::new("power_meter"), Some(ts), meter_reading())
            .await
            .unwrap();
    }

    gateway.ingestor().drain_publishers().await;
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.device_id.as_str(), "device_001");
        seen.push(event.timestamp);
    }
    assert_eq!(seen, vec![1_000, 2_000, 3_000]);
}

#[tokio::test]
async fn test_not_found_does_not_disturb_concurrent_queries() {
    let gateway = Arc::new(gateway());
    gateway
        .ingestor()
        .ingest(&DeviceId::new("power_meter"), Some(1_000), meter_reading())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            let id = if i % 2 == 0 { "power_meter" } else { "device_999" };
            gateway.query().get_latest(&DeviceId::new(id)).map(|l| l.values.len())
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let outcome = task.await.unwrap();
        if i % 2 == 0 {
            assert_eq!(outcome.unwrap(), 5);
        } else {
            assert!(matches!(outcome, Err(GatewayError::DeviceNotFound(id)) if id.as_str() == "device_999"));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_ticks_and_writes() {
    let gateway = gateway();
    let meter = DeviceId::new("power_meter");
    gateway.supervisor().start_device(
        meter.clone(),
        Duration::from_secs(1),
        Box::new(Scripted { tick: 0 }),
    );
    let mut events = gateway.hub().connect(ConnectionId::from("c1")).unwrap();
    gateway.hub().subscribe(&ConnectionId::from("c1"), &meter).unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(gateway.ingestor().ingested_total(), 2);

    gateway.shutdown().await.unwrap();
    assert!(gateway.supervisor().running().is_empty());

    let writes = gateway.store().stats().writes_total;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.store().stats().writes_total, writes);

    let err = gateway
        .ingestor()
        .ingest(&meter, None, meter_reading())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ShuttingDown));

    // Channel drains what was delivered, then reports closed.
    while events.recv().await.is_some() {}
    assert!(!gateway.ready().await.ready);
}

#[tokio::test(start_paused = true)]
async fn test_simulation_starts_every_device() {
    let gateway = gateway();
    assert_eq!(gateway.start_simulation(), 5);
    assert_eq!(gateway.supervisor().running().len(), 5);

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(gateway.ingestor().ingested_total(), 5);

    let latest = gateway.query().get_latest(&DeviceId::new("power_meter")).unwrap();
    assert_eq!(latest.values.len(), 5);

    gateway.shutdown().await.unwrap();
}
