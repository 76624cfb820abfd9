pub mod api;
pub mod config;
pub mod error;
pub mod extractor;
pub mod intake;
pub mod mapper;
pub mod metrics;
pub mod pipeline;
pub mod reclaimer;
pub mod telemetry;
pub mod worker;
pub mod worker_pool;

// Re-export commonly used types for easier testing
pub use crate::api::{create_router, ApiError, AppState, FailureBody};
pub use crate::config::{Config, TelemetryConfig, UploadConfig, WorkerConfig};
pub use crate::error::{ConfigError, PipelineError};
pub use crate::extractor::{extract_document, ExtractedDocument, ExtractionMethod};
pub use crate::intake::{UploadIntake, UploadedAsset};
pub use crate::mapper::{ClassificationReply, ResponseEnvelope, ResponseMode, Verdict};
pub use crate::pipeline::ClassificationPipeline;
pub use crate::reclaimer::{ReclaimOutcome, ScratchGuard};
pub use crate::telemetry::SensorStore;
pub use crate::worker::{WorkerInvocation, WorkerSpec};
pub use crate::worker_pool::WorkerPool;
