use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Intake metrics
    pub static ref UPLOADS: IntCounterVec = IntCounterVec::new(
        Opts::new("uploads_total", "Total number of image uploads by intake result"),
        &["result"]
    ).unwrap();

    // Worker metrics
    pub static ref WORKER_INVOCATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("worker_invocations_total", "Total number of classification runs by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref WORKER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "worker_duration_seconds",
            "Wall time of a worker process from spawn to drained exit"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
    ).unwrap();

    pub static ref WORKERS_IN_FLIGHT: IntGauge = IntGauge::new(
        "workers_in_flight",
        "Current number of running worker processes"
    ).unwrap();

    pub static ref WORKERS_QUEUED: IntGauge = IntGauge::new(
        "workers_queued",
        "Current number of requests waiting for a worker slot"
    ).unwrap();

    // Cleanup metrics
    pub static ref CLEANUP_FAILURES: IntCounter = IntCounter::new(
        "scratch_cleanup_failures_total",
        "Total number of scratch files that could not be deleted"
    ).unwrap();

    // Telemetry metrics
    pub static ref SENSOR_READINGS: IntCounter = IntCounter::new(
        "sensor_readings_total",
        "Total number of sensor readings ingested"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS.clone()),
            Box::new(WORKER_INVOCATIONS.clone()),
            Box::new(WORKER_DURATION.clone()),
            Box::new(WORKERS_IN_FLIGHT.clone()),
            Box::new(WORKERS_QUEUED.clone()),
            Box::new(CLEANUP_FAILURES.clone()),
            Box::new(SENSOR_READINGS.clone()),
        ];

        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register metric collector: {}", e);
            }
        }

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
