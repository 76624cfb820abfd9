use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the upload-to-result pipeline.
///
/// Intake and launch errors are raised before any worker process exists.
/// Worker and parse errors carry the captured streams so the HTTP layer can
/// hand them to operators.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No file uploaded")]
    NoFileProvided,

    #[error("Unsupported media type: {file_name} ({mime_type})")]
    UnsupportedMediaType { file_name: String, mime_type: String },

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    #[error("Failed to write upload to {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Failed to launch worker `{command}`: {source}")]
    WorkerLaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker exceeded timeout of {}s", timeout.as_secs_f64())]
    WorkerTimeout { timeout: Duration, stderr: String },

    #[error("Worker exited with {}", describe_exit(*code))]
    WorkerNonZeroExit { code: Option<i32>, stderr: String },

    #[error("Malformed worker output: {reason}")]
    MalformedWorkerOutput {
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NoFileProvided => "no_file",
            PipelineError::UnsupportedMediaType { .. } => "unsupported_media_type",
            PipelineError::InvalidUpload(_) => "invalid_upload",
            PipelineError::PayloadTooLarge { .. } => "payload_too_large",
            PipelineError::WriteFailed { .. } => "write_failed",
            PipelineError::ModelNotFound(_) => "model_not_found",
            PipelineError::WorkerLaunchFailed { .. } => "launch_failed",
            PipelineError::WorkerTimeout { .. } => "timeout",
            PipelineError::WorkerNonZeroExit { .. } => "non_zero_exit",
            PipelineError::MalformedWorkerOutput { .. } => "malformed",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// True for errors raised before a worker process was spawned.
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self,
            PipelineError::NoFileProvided
                | PipelineError::UnsupportedMediaType { .. }
                | PipelineError::InvalidUpload(_)
                | PipelineError::PayloadTooLarge { .. }
                | PipelineError::WriteFailed { .. }
                | PipelineError::ModelNotFound(_)
                | PipelineError::WorkerLaunchFailed { .. }
        )
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

/// Configuration errors surfaced at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
