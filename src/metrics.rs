//! `MetricsExt`: an event-counting extension publishing a periodic JSON snapshot of poll volume,
//! slow-response count, and per-error-bucket counts. Grounded in the original's
//! `extensions/metrics/metrics_collection_extension.py`.

use crate::broker::Broker;
use homie5::client::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default, Debug, serde::Serialize)]
struct Snapshot {
    total_polls: u64,
    slow_responses: u64,
    error_stats: HashMap<String, u64>,
}

pub struct MetricsExt {
    service_id: String,
    broker: Arc<Broker>,
    publish_interval: Duration,
    state: Mutex<Snapshot>,
}

impl MetricsExt {
    pub fn new(service_id: impl Into<String>, broker: Arc<Broker>, publish_interval: Duration) -> Self {
        Self { service_id: service_id.into(), broker, publish_interval, state: Mutex::new(Snapshot::default()) }
    }

    pub async fn inc_total(&self) {
        self.state.lock().await.total_polls += 1;
    }

    pub async fn inc_slow(&self) {
        self.state.lock().await.slow_responses += 1;
    }

    pub async fn record_error(&self, bucket: impl Into<String>) {
        *self.state.lock().await.error_stats.entry(bucket.into()).or_insert(0) += 1;
    }

    async fn publish_snapshot(&self) {
        let snapshot = self.state.lock().await;
        let payload = serde_json::to_vec(&*snapshot).unwrap_or_default();
        drop(snapshot);
        let topic = format!("{}/bridge/metrics", self.service_id);
        if let Err(e) = self.broker.publish(topic, QoS::AtLeastOnce, false, payload).await {
            tracing::error!(error = %e, "failed to publish metrics snapshot");
        }
    }

    /// Runs until cancelled, publishing a snapshot every `publish_interval`.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.publish_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_snapshot().await,
                _ = cancel.cancelled() => {
                    self.publish_snapshot().await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_with_expected_keys() {
        let snapshot = Snapshot { total_polls: 3, slow_responses: 1, error_stats: HashMap::from([("ERR_905".to_string(), 2)]) };
        let v: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(v["total_polls"], 3);
        assert_eq!(v["error_stats"]["ERR_905"], 2);
    }
}
