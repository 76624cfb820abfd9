//! Classification Pipeline
//!
//! The single upload-to-result flow shared by both classification endpoints:
//! intake, pool admission, worker run, cleanup, extraction and mapping.
//! The scratch file is reclaimed on the direct completion path right after
//! the worker terminates, before any reply is built.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::extractor::extract_document;
use crate::intake::{UploadIntake, UploadedAsset};
use crate::mapper::{map_document, ClassificationReply, ResponseMode};
use crate::metrics::{self, Timer};
use crate::reclaimer::ScratchGuard;
use crate::worker::{WorkerInvocation, WorkerSpec};
use crate::worker_pool::WorkerPool;
use axum::extract::Multipart;
use std::path::Path;
use tracing::{debug, info, warn};

/// Lifecycle of one classification request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    FileValidated,
    Persisted,
    WorkerRunning,
    WorkerExited,
    Reclaimed,
    Parsed,
    ParseFailed,
    Responded,
}

fn enter(stage: RequestStage) {
    debug!(stage = ?stage, "Request stage");
}

#[derive(Debug, Clone)]
pub struct ClassificationPipeline {
    intake: UploadIntake,
    worker: WorkerSpec,
    pool: WorkerPool,
}

impl ClassificationPipeline {
    pub fn new(intake: UploadIntake, worker: WorkerSpec, pool: WorkerPool) -> Self {
        Self {
            intake,
            worker,
            pool,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            UploadIntake::new(
                config.upload_config.scratch_dir.clone(),
                config.upload_config.max_upload_bytes,
            ),
            WorkerSpec::from_config(&config.worker_config),
            WorkerPool::new(config.worker_config.max_concurrent_workers),
        )
    }

    pub fn intake(&self) -> &UploadIntake {
        &self.intake
    }

    pub fn worker(&self) -> &WorkerSpec {
        &self.worker
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run the whole pipeline for a multipart request
    pub async fn handle_multipart(
        &self,
        multipart: Multipart,
        mode: ResponseMode,
    ) -> Result<ClassificationReply> {
        enter(RequestStage::Received);

        let asset = match self.intake.receive_multipart(multipart).await {
            Ok(asset) => {
                metrics::UPLOADS.with_label_values(&["accepted"]).inc();
                asset
            }
            Err(e) => {
                metrics::UPLOADS.with_label_values(&[e.kind()]).inc();
                warn!(error = %e, "Upload rejected");
                return Err(e);
            }
        };

        self.process(asset, mode).await
    }

    /// Run everything after intake for an already persisted upload.
    ///
    /// The asset is moved into the reclaimer here, so every return path
    /// (including cancellation) deletes the scratch file.
    pub async fn process(&self, asset: UploadedAsset, mode: ResponseMode) -> Result<ClassificationReply> {
        enter(RequestStage::FileValidated);
        let guard = ScratchGuard::new(asset);
        enter(RequestStage::Persisted);

        info!(
            path = %guard.path().display(),
            original_name = %guard.asset().original_name,
            size_bytes = guard.asset().size_bytes,
            "Processing upload"
        );

        let invocation = self.run_worker(guard.path()).await;

        guard.reclaim().await;
        enter(RequestStage::Reclaimed);

        let result = invocation.and_then(|invocation| self.interpret(&invocation, mode));

        let outcome = match &result {
            Ok(reply) if reply.is_success() => "success",
            Ok(_) => "domain_failure",
            Err(e) => e.kind(),
        };
        metrics::WORKER_INVOCATIONS.with_label_values(&[outcome]).inc();
        enter(RequestStage::Responded);

        result
    }

    async fn run_worker(&self, image_path: &Path) -> Result<WorkerInvocation> {
        let _permit = self.pool.acquire().await?;
        enter(RequestStage::WorkerRunning);

        let timer = Timer::new();
        let invocation = self.worker.invoke(image_path).await;
        // model and launch failures never ran a process
        if !matches!(&invocation, Err(e) if e.is_pre_spawn()) {
            timer.observe_duration_seconds(&metrics::WORKER_DURATION);
        }

        enter(RequestStage::WorkerExited);
        invocation
    }

    fn interpret(&self, invocation: &WorkerInvocation, mode: ResponseMode) -> Result<ClassificationReply> {
        let stderr = invocation.stderr_text();

        if !invocation.succeeded() {
            warn!(exit_code = ?invocation.exit_code, stderr = %stderr, "Worker failed");
            return Err(PipelineError::WorkerNonZeroExit {
                code: invocation.exit_code,
                stderr,
            });
        }

        let stdout = invocation.stdout_text();
        let document = extract_document(&invocation.stdout);
        debug!(
            method = ?document.method,
            bounded = document.has_boundary(),
            document = %document.text,
            "Extracted worker document"
        );

        match map_document(&document, &stdout, &stderr, mode) {
            Ok(reply) => {
                enter(RequestStage::Parsed);
                Ok(reply)
            }
            Err(e) => {
                enter(RequestStage::ParseFailed);
                warn!(error = %e, "Could not decode worker output");
                Err(e)
            }
        }
    }
}
