//! Ingestion Pipeline (§4.D) — one cooperative worker task per device.
//!
//! Every point entering the system, whether from the HTTP edge or the MQTT
//! bridge, is handed to the worker owning its device over a private `mpsc`
//! channel. The worker is the only writer of that device's arrival sequence,
//! detector state, and persistence calls, so ordering and scoring are
//! trivially correct per device without a shared lock. Workers are spawned
//! lazily on first contact and reaped after an idle timeout.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use telemetry_types::{Anomaly, BusEvent, Location, Point, PointInput};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use uuid::Uuid;

use crate::config::Config;
use crate::detector::DetectorRegistry;
use crate::error::{ClientError, PipelineError, StoreError};
use crate::event_bus::EventBus;
use crate::persistence::PersistenceGateway;

const WORKER_CHANNEL_CAPACITY: usize = 256;
const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct IngestOutcome {
    pub metrics_inserted: usize,
    pub anomalies_detected: usize,
}

enum WorkerCommand {
    HttpBatch {
        points: Vec<PointInput>,
        respond: oneshot::Sender<Result<IngestOutcome, PipelineError>>,
    },
    MqttPoint {
        point: PointInput,
    },
    UpdateLocation {
        location: Location,
    },
}

struct WorkerHandle {
    sender: mpsc::Sender<WorkerCommand>,
    last_activity: Arc<Mutex<Instant>>,
    task: tokio::task::JoinHandle<()>,
}

/// Immutable context shared by every device worker task. Cloned (cheaply —
/// all fields are `Arc` or `Copy`) into each spawned task.
#[derive(Clone)]
struct WorkerContext {
    store: Arc<PersistenceGateway>,
    bus: Arc<EventBus>,
    detectors: Arc<DetectorRegistry>,
    allow_auto_device: bool,
    mqtt_batch_size: usize,
    mqtt_batch_interval: Duration,
}

impl WorkerContext {
    /// Resolves the device exactly once per worker lifetime (the result is
    /// cached in `resolved`, owned by the worker's run loop) — every later
    /// batch for this device skips the round trip.
    async fn ensure_device(&self, device_id: &str, resolved: &mut bool) -> Result<(), PipelineError> {
        if *resolved {
            return Ok(());
        }
        let existed = match self.store.get_device(device_id).await? {
            Some(_) => true,
            None if self.allow_auto_device => {
                self.store.insert_device(device_id, device_id, None).await?;
                false
            }
            None => return Err(ClientError::UnknownDevice(device_id.to_string()).into()),
        };
        *resolved = true;

        // A freshly auto-provisioned device has no history to warm from; skip
        // the round trip. An existing device may have points from before this
        // worker was spawned (first touch after a restart, or reaped and
        // respawned), so its detector windows start cold unless seeded here.
        if existed {
            let window = self.detectors.window_size() as i64;
            match self.store.list_recent_points(device_id, window).await {
                Ok(points) => self.detectors.warm(device_id, &points).await,
                Err(err) => {
                    tracing::warn!(device_id, error = %err, "failed to warm detector state from history");
                }
            }
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        device_id: &str,
        inputs: Vec<PointInput>,
        arrival_seq: &mut u64,
        device_resolved: &mut bool,
    ) -> Result<IngestOutcome, PipelineError> {
        self.ensure_device(device_id, device_resolved).await?;

        if inputs.is_empty() {
            return Ok(IngestOutcome { metrics_inserted: 0, anomalies_detected: 0 });
        }

        let now = Utc::now();
        let mut points = Vec::with_capacity(inputs.len());
        for input in inputs {
            if input.measurements.has_non_finite() {
                return Err(ClientError::InvalidPoint(
                    "measurement contains a NaN or infinite value".to_string(),
                )
                .into());
            }
            points.push(Point {
                id: Uuid::new_v4(),
                device_id: device_id.to_string(),
                arrival_seq: *arrival_seq,
                ts: input.ts.unwrap_or(now),
                measurements: input.measurements,
            });
            *arrival_seq += 1;
        }

        self.store.insert_points(&points).await?;

        let (results, tag) = self.detectors.score_batch(device_id, &points).await;

        let mut anomalies_detected = 0;
        for (point, result) in points.iter().zip(results.iter()) {
            self.bus.publish(BusEvent::MetricNew {
                device_id: device_id.to_string(),
                metric: point.clone(),
            });

            if !result.is_anomaly {
                continue;
            }

            let anomaly = Anomaly {
                id: Uuid::new_v4(),
                device_id: device_id.to_string(),
                point_id: Some(point.id),
                score: result.score,
                detector: tag,
                flagged: true,
                ts: point.ts,
            };

            if let Err(err) = self.store.insert_anomalies(std::slice::from_ref(&anomaly)).await {
                tracing::warn!(device_id, error = %err, "failed to persist anomaly, suppressing anomaly:new");
                continue;
            }
            anomalies_detected += 1;
            self.bus.publish(BusEvent::AnomalyNew { device_id: device_id.to_string(), anomaly });
        }

        Ok(IngestOutcome { metrics_inserted: points.len(), anomalies_detected })
    }

    async fn update_location(&self, device_id: &str, location: Location, resolved: &mut bool) {
        if let Err(err) = self.ensure_device(device_id, resolved).await {
            tracing::warn!(device_id, error = %err, "could not resolve device for location update");
            return;
        }
        match self.store.insert_device(device_id, device_id, Some(location)).await {
            Ok(device) => {
                self.bus
                    .publish(BusEvent::DeviceUpdate { device_id: device_id.to_string(), device });
            }
            Err(err) => {
                tracing::warn!(device_id, error = %err, "failed to persist device location update");
            }
        }
    }
}

async fn run_worker(device_id: String, mut rx: mpsc::Receiver<WorkerCommand>, ctx: WorkerContext) {
    let mut mqtt_buffer: Vec<PointInput> = Vec::new();
    let mut batch_deadline: Option<Instant> = None;
    let mut arrival_seq: u64 = 0;
    let mut device_resolved = false;

    loop {
        let timeout = batch_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(WorkerCommand::HttpBatch { points, respond }) => {
                        let result = ctx
                            .process_batch(&device_id, points, &mut arrival_seq, &mut device_resolved)
                            .await;
                        let _ = respond.send(result);
                    }
                    Some(WorkerCommand::MqttPoint { point }) => {
                        if mqtt_buffer.is_empty() {
                            batch_deadline = Some(Instant::now() + ctx.mqtt_batch_interval);
                        }
                        mqtt_buffer.push(point);
                        if mqtt_buffer.len() >= ctx.mqtt_batch_size {
                            let batch = std::mem::take(&mut mqtt_buffer);
                            batch_deadline = None;
                            if let Err(err) = ctx
                                .process_batch(&device_id, batch, &mut arrival_seq, &mut device_resolved)
                                .await
                            {
                                tracing::warn!(device_id, error = %err, "mqtt micro-batch flush (size trigger) failed");
                            }
                        }
                    }
                    Some(WorkerCommand::UpdateLocation { location }) => {
                        ctx.update_location(&device_id, location, &mut device_resolved).await;
                    }
                    None => break,
                }
            }
            _ = time::sleep(timeout.unwrap_or(Duration::from_secs(3600))), if timeout.is_some() => {
                let batch = std::mem::take(&mut mqtt_buffer);
                batch_deadline = None;
                if !batch.is_empty() {
                    if let Err(err) = ctx
                        .process_batch(&device_id, batch, &mut arrival_seq, &mut device_resolved)
                        .await
                    {
                        tracing::warn!(device_id, error = %err, "mqtt micro-batch flush (time trigger) failed");
                    }
                }
            }
        }
    }

    if !mqtt_buffer.is_empty() {
        if let Err(err) = ctx
            .process_batch(&device_id, mqtt_buffer, &mut arrival_seq, &mut device_resolved)
            .await
        {
            tracing::warn!(device_id, error = %err, "failed to flush mqtt buffer during worker shutdown");
        }
    }
}

/// Owns the per-device worker table. This is the single entry point both
/// edges (HTTP, MQTT) use to submit points.
pub struct Pipeline {
    store: Arc<PersistenceGateway>,
    bus: Arc<EventBus>,
    detectors: Arc<DetectorRegistry>,
    workers: DashMap<String, WorkerHandle>,
    allow_auto_device: bool,
    mqtt_batch_size: usize,
    mqtt_batch_interval: Duration,
    idle_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        store: Arc<PersistenceGateway>,
        bus: Arc<EventBus>,
        detectors: Arc<DetectorRegistry>,
        config: &Config,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            store,
            bus,
            detectors,
            workers: DashMap::new(),
            allow_auto_device: config.allow_auto_device,
            mqtt_batch_size: config.mqtt_batch_size,
            mqtt_batch_interval: config.mqtt_batch_interval,
            idle_timeout: config.idle_worker_timeout,
        });
        Self::spawn_reaper(pipeline.clone());
        pipeline
    }

    fn spawn_reaper(pipeline: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                pipeline.reap_idle_workers();
            }
        });
    }

    fn reap_idle_workers(&self) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        self.workers.retain(|device_id, handle| {
            let idle = now.duration_since(*handle.last_activity.lock().expect("worker clock poisoned"));
            let keep = idle < idle_timeout;
            if !keep {
                tracing::debug!(device_id, "reaping idle device worker");
            }
            keep
        });
    }

    fn worker_for(&self, device_id: &str) -> mpsc::Sender<WorkerCommand> {
        if let Some(handle) = self.workers.get(device_id) {
            *handle.last_activity.lock().expect("worker clock poisoned") = Instant::now();
            return handle.sender.clone();
        }

        let (sender, receiver) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let ctx = WorkerContext {
            store: self.store.clone(),
            bus: self.bus.clone(),
            detectors: self.detectors.clone(),
            allow_auto_device: self.allow_auto_device,
            mqtt_batch_size: self.mqtt_batch_size,
            mqtt_batch_interval: self.mqtt_batch_interval,
        };
        let owned_device_id = device_id.to_string();
        let task = tokio::spawn(async move { run_worker(owned_device_id, receiver, ctx).await });

        self.workers.insert(
            device_id.to_string(),
            WorkerHandle { sender: sender.clone(), last_activity, task },
        );

        sender
    }

    /// Blocks until the batch has been persisted, scored, and published.
    pub async fn submit_http_batch(
        &self,
        device_id: &str,
        points: Vec<PointInput>,
    ) -> Result<IngestOutcome, PipelineError> {
        let sender = self.worker_for(device_id);
        let (respond, response) = oneshot::channel();
        sender
            .send(WorkerCommand::HttpBatch { points, respond })
            .await
            .map_err(|_| StoreError::Connection("device worker channel closed".to_string()))?;
        response
            .await
            .map_err(|_| StoreError::Connection("device worker dropped the response channel".to_string()))?
    }

    /// Never blocks on persistence — enqueues into the device's buffer and
    /// returns immediately.
    pub async fn submit_mqtt_point(&self, device_id: &str, point: PointInput) {
        let sender = self.worker_for(device_id);
        if sender.send(WorkerCommand::MqttPoint { point }).await.is_err() {
            tracing::warn!(device_id, "dropped mqtt point: device worker channel closed");
        }
    }

    pub async fn submit_location_update(&self, device_id: &str, location: Location) {
        let sender = self.worker_for(device_id);
        if sender.send(WorkerCommand::UpdateLocation { location }).await.is_err() {
            tracing::warn!(device_id, "dropped location update: device worker channel closed");
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Drains every per-device worker within a bounded grace period (spec
    /// §5, cancellation). Removing a worker's entry drops its `Sender`,
    /// which closes the channel; `run_worker` sees `rx.recv()` return `None`,
    /// flushes any buffered MQTT points, and returns. Workers still running
    /// past the grace period are abandoned rather than awaited further —
    /// the process is exiting regardless.
    pub async fn shutdown(&self, grace: Duration) {
        let device_ids: Vec<String> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        let mut tasks = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            if let Some((_, handle)) = self.workers.remove(&device_id) {
                tasks.push(handle.task);
            }
        }

        if time::timeout(grace, await_all(tasks)).await.is_err() {
            tracing::warn!("shutdown grace period elapsed before all device workers flushed");
        }
    }
}

/// Waits for every handle, ignoring join errors (a panicked worker has
/// nothing left to flush).
async fn await_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}
