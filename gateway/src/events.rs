use crate::actor::Feature;
use crate::metrics::GatewayMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Ok,
    Flagged,
    Blocked,
    RateLimited,
    UpstreamError,
    ClientGone,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Ok => "ok",
            RequestStatus::Flagged => "flagged",
            RequestStatus::Blocked => "blocked",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::UpstreamError => "upstream_error",
            RequestStatus::ClientGone => "client_gone",
        }
    }
}

/// One row per request that passed authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub actor_source: String,
    pub feature: Feature,
    pub model: String,
    pub status: RequestStatus,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u32>,
    pub upstream_latency_ms: u64,
    pub total_latency_ms: u64,
    #[serde(default)]
    pub flagged_reasons: Vec<String>,
}

/// Non-blocking emission seam; request latency must never wait on this.
pub trait EventSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Receives drained batches. The columnar-store transport lives outside the
/// core; in-process we write structured log lines.
#[async_trait]
pub trait TelemetryWriter: Send + Sync {
    async fn write_batch(&self, events: Vec<UsageEvent>) -> anyhow::Result<()>;
}

pub struct TracingTelemetryWriter;

#[async_trait]
impl TelemetryWriter for TracingTelemetryWriter {
    async fn write_batch(&self, events: Vec<UsageEvent>) -> anyhow::Result<()> {
        for event in events {
            match serde_json::to_string(&event) {
                Ok(row) => tracing::info!(target: "cody_gateway::usage", %row, "usage event"),
                Err(err) => warn!(?err, "Failed to serialize usage event"),
            }
        }
        Ok(())
    }
}

const DRAIN_BATCH: usize = 16;

/// Bounded queue drained by a small worker pool. `record` is send-or-drop:
/// when the queue is full the event is counted and discarded.
pub struct BufferedEventSink {
    // Taken (and dropped) by shutdown so workers see the channel close.
    tx: Mutex<Option<mpsc::Sender<UsageEvent>>>,
    capacity: usize,
    metrics: Arc<GatewayMetrics>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BufferedEventSink {
    pub fn new(
        writer: Arc<dyn TelemetryWriter>,
        metrics: Arc<GatewayMetrics>,
        buffer_size: usize,
        workers: usize,
    ) -> Arc<Self> {
        let buffer_size = buffer_size.max(1);
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<UsageEvent>(buffer_size);
        metrics.set_event_queue_capacity(buffer_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = Arc::clone(&rx);
            let writer = Arc::clone(&writer);
            handles.push(tokio::spawn(async move {
                loop {
                    let mut batch = Vec::with_capacity(DRAIN_BATCH);
                    {
                        let mut rx = rx.lock().await;
                        match rx.recv().await {
                            Some(event) => batch.push(event),
                            None => break,
                        }
                        while batch.len() < DRAIN_BATCH {
                            match rx.try_recv() {
                                Ok(event) => batch.push(event),
                                Err(_) => break,
                            }
                        }
                    }
                    if let Err(err) = writer.write_batch(batch).await {
                        warn!(?err, worker, "Failed to write usage event batch");
                    }
                }
                debug!(worker, "Event sink worker drained and stopped");
            }));
        }
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            capacity: buffer_size,
            metrics,
            workers: Mutex::new(handles),
        })
    }

    /// Default worker count when unconfigured.
    pub fn default_workers(buffer_size: usize) -> usize {
        (buffer_size / 64).max(1)
    }

    /// Close the queue and give workers a bounded grace period to finish.
    pub async fn shutdown(&self, grace: Duration) {
        // Dropping the sender ends `recv` once the backlog is consumed.
        {
            let mut tx = match self.tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tx.take();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Event sink drain exceeded grace period; events may be lost");
        }
    }
}

impl EventSink for BufferedEventSink {
    fn record(&self, event: UsageEvent) {
        let tx = {
            let guard = match self.tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        let Some(tx) = tx else {
            warn!("Event sink closed; dropping usage event");
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {
                let depth = self.capacity.saturating_sub(tx.capacity());
                self.metrics.set_event_queue_depth(depth);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.inc_dropped_events();
                warn!(
                    request_id = %event.request_id,
                    feature = %event.feature,
                    "Event sink saturated; dropping usage event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Event sink closed; dropping usage event");
            }
        }
    }
}
