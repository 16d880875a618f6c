//! Per-device tick scheduling
//!
//! One repeating task per device, each with its own stop channel. Stopping a task
//! takes effect between ticks; a tick already writing runs to completion.

use meterline_core::{now_millis, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ReadingSource, TelemetryIngestor};
use crate::error::GatewayError;

struct TickTask {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TickSupervisor {
    ingestor: Arc<TelemetryIngestor>,
    tasks: Mutex<HashMap<DeviceId, TickTask>>,
}

impl TickSupervisor {
    pub fn new(ingestor: Arc<TelemetryIngestor>) -> Self {
        Self {
            ingestor,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start ticking a device every `period`. Returns false if it is already running.
    ///
    /// The first tick fires one period after start.
    pub fn start_device(
        &self,
        device_id: DeviceId,
        period: Duration,
        mut source: Box<dyn ReadingSource>,
    ) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&device_id) {
            return false;
        }

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let ingestor = Arc::clone(&self.ingestor);
        let task_device = device_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.recv() => {
                        debug!(device_id = %task_device, "Tick task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = now_millis();
                        let values = source.next_reading(now);
                        match ingestor.ingest(&task_device, Some(now), values).await {
                            Ok(_) => {}
                            Err(GatewayError::ShuttingDown) => break,
                            Err(e) => {
                                warn!(device_id = %task_device, error = %e, "Tick failed");
                            }
                        }
                    }
                }
            }
        });

        info!(device_id = %device_id, period_ms = period.as_millis() as u64, "Tick task started");
        tasks.insert(device_id, TickTask { stop_tx, handle });
        true
    }

    /// Stop one device's task and wait for it. Returns false if it was not running.
    pub async fn stop_device(&self, device_id: &DeviceId) -> bool {
        let task = self.tasks.lock().remove(device_id);
        match task {
            Some(task) => {
                Self::join(device_id, task).await;
                true
            }
            None => false,
        }
    }

    /// Stop every task and wait for all of them. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(DeviceId, TickTask)> = self.tasks.lock().drain().collect();
        let count = drained.len();

        for (_, task) in &drained {
            let _ = task.stop_tx.try_send(());
        }
        for (device_id, task) in drained {
            Self::join(&device_id, task).await;
        }

        if count > 0 {
            info!(stopped = count, "All tick tasks stopped");
        }
        count
    }

    pub fn running(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn join(device_id: &DeviceId, task: TickTask) {
        let _ = task.stop_tx.try_send(());
        if let Err(e) = task.handle.await {
            warn!(device_id = %device_id, error = %e, "Tick task ended abnormally");
        }
    }
}
