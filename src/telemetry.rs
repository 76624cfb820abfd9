//! Sensor Telemetry Store
//!
//! Holds the most recent sensor reading pushed by the field bridge. One
//! writer replaces the reading; any number of readers take snapshots.
//! Readings are never expired, but every snapshot reports its age and
//! whether it is older than the configured staleness window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Reading plus its freshness at the time it was read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub success: bool,
    pub reading: Value,
    pub received_at: DateTime<Utc>,
    pub age_seconds: f64,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct SensorStore {
    latest: Arc<RwLock<Option<SensorReading>>>,
    stale_after: Duration,
}

impl SensorStore {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            latest: Arc::new(RwLock::new(None)),
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Replace the latest reading. Only JSON objects are accepted.
    pub async fn record(&self, payload: Value) -> Result<DateTime<Utc>, String> {
        if !payload.is_object() {
            return Err("Sensor payload must be a JSON object".to_string());
        }

        let received_at = Utc::now();
        *self.latest.write().await = Some(SensorReading {
            payload,
            received_at,
        });

        crate::metrics::SENSOR_READINGS.inc();
        tracing::debug!(received_at = %received_at, "Sensor reading stored");
        Ok(received_at)
    }

    pub async fn latest(&self) -> Option<SensorSnapshot> {
        self.snapshot_at(Utc::now()).await
    }

    async fn snapshot_at(&self, now: DateTime<Utc>) -> Option<SensorSnapshot> {
        let guard = self.latest.read().await;
        let reading = guard.as_ref()?;

        let age = (now - reading.received_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        Some(SensorSnapshot {
            success: true,
            reading: reading.payload.clone(),
            received_at: reading.received_at,
            age_seconds: age.as_secs_f64(),
            stale: age > self.stale_after,
        })
    }
}
