//! HTTP surface
//!
//! Two classification entry points share one pipeline and differ only in
//! response mode: `/api/classify` passes the worker document through and
//! `/api/analyze` returns the normalized envelope. Every failure is a JSON
//! body with `success: false`.

use crate::config::Config;
use crate::error::PipelineError;
use crate::mapper::{EnvelopeError, ResponseMode, SOURCE_PARSING, SOURCE_WORKER};
use crate::pipeline::ClassificationPipeline;
use crate::telemetry::SensorStore;
use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        State,
    },
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Room for multipart boundaries and headers on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ClassificationPipeline>,
    pub sensors: SensorStore,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn from_config(config: Config) -> Self {
        Self {
            pipeline: Arc::new(ClassificationPipeline::from_config(&config)),
            sensors: SensorStore::new(Duration::from_secs(config.telemetry_config.stale_after_secs)),
            config: Arc::new(config),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state
        .pipeline
        .intake()
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/", get(server_info_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/model-path", get(model_path_handler))
        .route("/api/classify", post(classify_handler))
        .route("/api/analyze", post(analyze_handler))
        .route(
            "/api/sensor-data",
            get(get_sensor_data_handler).post(post_sensor_data_handler),
        )
        .fallback(not_found_handler)
        .method_not_allowed_fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// JSON body for every failed request
#[derive(Debug, Clone, Serialize)]
pub struct FailureBody {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(rename = "pythonError", skip_serializing_if = "Option::is_none")]
    pub worker_stderr: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<EnvelopeError>,
}

impl FailureBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            details: None,
            worker_stderr: None,
            errors: Vec::new(),
        }
    }

    fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn envelope_error(mut self, source: &str, message: impl Into<String>) -> Self {
        self.errors.push(EnvelopeError::new(source, message));
        self
    }
}

/// HTTP mapping for pipeline failures
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status_and_body(&self) -> (StatusCode, FailureBody) {
        match &self.0 {
            PipelineError::NoFileProvided => {
                (StatusCode::BAD_REQUEST, FailureBody::new("No file uploaded"))
            }
            PipelineError::UnsupportedMediaType { file_name, mime_type } => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                FailureBody::new("Only image files are allowed!").details(format!(
                    "Rejected {} ({}); allowed: jpeg, jpg, png, gif",
                    file_name, mime_type
                )),
            ),
            PipelineError::InvalidUpload(reason) => (
                StatusCode::BAD_REQUEST,
                FailureBody::new("Invalid upload").details(reason.clone()),
            ),
            PipelineError::PayloadTooLarge { limit } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                FailureBody::new("Upload too large")
                    .details(format!("Uploads are limited to {} bytes", limit)),
            ),
            PipelineError::WriteFailed { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                FailureBody::new("Failed to store upload").details(self.0.to_string()),
            ),
            PipelineError::ModelNotFound(path) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                FailureBody::new("Model file not found")
                    .details(format!("Could not find model at path: {}", path.display())),
            ),
            PipelineError::WorkerLaunchFailed { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                FailureBody::new("Failed to start classification worker")
                    .details(self.0.to_string()),
            ),
            PipelineError::WorkerTimeout { stderr, .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                FailureBody::new("Classification timed out")
                    .details(self.0.to_string())
                    .envelope_error(SOURCE_WORKER, stderr.clone()),
            ),
            PipelineError::WorkerNonZeroExit { stderr, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                FailureBody::new("Classification failed")
                    .details(stderr.clone())
                    .envelope_error(SOURCE_WORKER, stderr.clone()),
            ),
            PipelineError::MalformedWorkerOutput {
                reason,
                stdout,
                stderr,
            } => {
                let mut body = FailureBody::new("Error parsing classification results")
                    .details(stdout.clone())
                    .envelope_error(SOURCE_PARSING, reason.clone());
                body.worker_stderr = Some(stderr.clone());
                (StatusCode::INTERNAL_SERVER_ERROR, body)
            }
            PipelineError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, FailureBody::new(message.clone()))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        let pre_spawn = self.0.is_pre_spawn();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), pre_spawn, error = %self.0, "Request failed");
        } else {
            tracing::warn!(kind = self.0.kind(), pre_spawn, error = %self.0, "Request rejected");
        }
        (status, Json(body)).into_response()
    }
}

async fn classify_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    run_classification(state, multipart, ResponseMode::PassThrough).await
}

async fn analyze_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    run_classification(state, multipart, ResponseMode::Normalized).await
}

async fn run_classification(
    state: AppState,
    multipart: Result<Multipart, MultipartRejection>,
    mode: ResponseMode,
) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("classification", %request_id, mode = ?mode);

    async move {
        let multipart = match multipart {
            Ok(multipart) => multipart,
            Err(rejection) => {
                tracing::debug!(reason = %rejection.body_text(), "Request is not multipart");
                return ApiError(PipelineError::NoFileProvided).into_response();
            }
        };

        match state.pipeline.handle_multipart(multipart, mode).await {
            Ok(reply) => {
                tracing::info!(success = reply.is_success(), "Classification finished");
                Json(reply).into_response()
            }
            Err(e) => ApiError(e).into_response(),
        }
    }
    .instrument(span)
    .await
}

async fn server_info_handler() -> Json<Value> {
    Json(json!({
        "name": "Tower Classification API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "Running",
        "endpoints": [
            {"path": "/api/status", "method": "GET", "description": "Check if server is running"},
            {"path": "/api/model-path", "method": "GET", "description": "Check model file path and status"},
            {"path": "/api/classify", "method": "POST", "description": "Upload and classify tower image"},
            {"path": "/api/analyze", "method": "POST", "description": "Upload and classify tower image (normalized response)"},
            {"path": "/api/sensor-data", "method": "GET", "description": "Latest sensor reading"},
            {"path": "/api/sensor-data", "method": "POST", "description": "Submit a sensor reading"},
            {"path": "/health", "method": "GET", "description": "Health check"},
            {"path": "/metrics", "method": "GET", "description": "Prometheus metrics"}
        ]
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    tracing::debug!("Status endpoint called");
    let pool = state.pipeline.pool().stats();
    Json(json!({
        "status": "running",
        "workers": {
            "capacity": pool.capacity,
            "inFlight": pool.in_flight,
            "queued": pool.queued,
            "utilizationPercent": pool.utilization_percent(),
        }
    }))
}

async fn model_path_handler(State(state): State<AppState>) -> Json<Value> {
    let model_path = &state.pipeline.worker().model_path;
    let size = tokio::fs::metadata(model_path).await.ok().map(|m| m.len());

    Json(json!({
        "modelPath": model_path.display().to_string(),
        "exists": size.is_some(),
        "size": size,
    }))
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::export_metrics(),
    )
}

async fn post_sensor_data_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(FailureBody::new("Invalid sensor data").details(rejection.body_text())),
            )
                .into_response();
        }
    };

    match state.sensors.record(payload).await {
        Ok(received_at) => Json(json!({
            "success": true,
            "received_at": received_at,
        }))
        .into_response(),
        Err(reason) => (
            StatusCode::BAD_REQUEST,
            Json(FailureBody::new("Invalid sensor data").details(reason)),
        )
            .into_response(),
    }
}

async fn get_sensor_data_handler(State(state): State<AppState>) -> Response {
    match state.sensors.latest().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(FailureBody::new("No sensor data received yet")),
        )
            .into_response(),
    }
}

async fn not_found_handler(method: Method, uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(FailureBody::new(format!("Cannot {} {}", method, uri.path()))),
    )
        .into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Internal server error".to_string()
    };

    tracing::error!(panic = %message, "Handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(FailureBody::new(message)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn body_of(err: PipelineError) -> (StatusCode, Value) {
        let (status, body) = ApiError(err).status_and_body();
        (status, serde_json::to_value(body).unwrap())
    }

    #[test]
    fn test_no_file_body() {
        let (status, body) = body_of(PipelineError::NoFileProvided);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "No file uploaded"}));
    }

    #[test]
    fn test_model_not_found_body() {
        let (status, body) = body_of(PipelineError::ModelNotFound(PathBuf::from("/m/tower.pth")));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Model file not found");
        assert_eq!(body["details"], "Could not find model at path: /m/tower.pth");
    }

    #[test]
    fn test_non_zero_exit_carries_stderr_verbatim() {
        let stderr = "Traceback (most recent call last):\n  boom\n";
        let (status, body) = body_of(PipelineError::WorkerNonZeroExit {
            code: Some(1),
            stderr: stderr.to_string(),
        });

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Classification failed");
        assert_eq!(body["details"], stderr);
        assert_eq!(body["errors"], json!([{"source": "worker", "message": stderr}]));
    }

    #[test]
    fn test_malformed_output_body() {
        let (status, body) = body_of(PipelineError::MalformedWorkerOutput {
            reason: "expected value at line 1 column 1".to_string(),
            stdout: "no json here".to_string(),
            stderr: "warning".to_string(),
        });

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Error parsing classification results");
        assert_eq!(body["details"], "no json here");
        assert_eq!(body["pythonError"], "warning");
        assert_eq!(body["errors"][0]["source"], "parsing");
    }

    #[test]
    fn test_timeout_status() {
        let (status, body) = body_of(PipelineError::WorkerTimeout {
            timeout: Duration::from_secs(5),
            stderr: String::new(),
        });
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["success"], false);
    }

    #[test]
    fn test_panic_message_is_surfaced() {
        let response = panic_response(Box::new("worker table corrupted"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
