//! Resource Reclaimer
//!
//! Owns an uploaded scratch file and deletes it exactly once. The normal path
//! calls [`ScratchGuard::reclaim`] as soon as the worker has terminated; if the
//! request is dropped before that, `Drop` removes the file instead.

use crate::intake::UploadedAsset;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Deleted,
    /// Nothing to delete; counts as reclaimed
    AlreadyGone,
    /// Logged and counted, never surfaced to the caller
    Failed(String),
}

#[derive(Debug)]
pub struct ScratchGuard {
    asset: UploadedAsset,
    reclaimed: bool,
}

impl ScratchGuard {
    pub fn new(asset: UploadedAsset) -> Self {
        Self {
            asset,
            reclaimed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.asset.temporary_path
    }

    pub fn asset(&self) -> &UploadedAsset {
        &self.asset
    }

    /// Delete the scratch file. Consumes the guard so the asset cannot be
    /// used afterwards.
    pub async fn reclaim(mut self) -> ReclaimOutcome {
        self.reclaimed = true;
        let result = tokio::fs::remove_file(&self.asset.temporary_path).await;
        record(&self.asset.temporary_path, result)
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }
        debug!(
            path = %self.asset.temporary_path.display(),
            "Request dropped before cleanup, reclaiming scratch file"
        );
        // Drop cannot await; a single unlink is short enough to block on
        let result = std::fs::remove_file(&self.asset.temporary_path);
        record(&self.asset.temporary_path, result);
    }
}

fn record(path: &Path, result: std::io::Result<()>) -> ReclaimOutcome {
    match result {
        Ok(()) => {
            debug!(path = %path.display(), "Deleted scratch file");
            ReclaimOutcome::Deleted
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Scratch file already gone");
            ReclaimOutcome::AlreadyGone
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete scratch file");
            crate::metrics::CLEANUP_FAILURES.inc();
            ReclaimOutcome::Failed(e.to_string())
        }
    }
}
