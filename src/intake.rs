//! Payload Intake
//!
//! Validates an uploaded image against the extension and media-type
//! allow-lists and streams it into the scratch directory under a
//! collision-resistant name. Nothing touches the disk until both checks pass.

use crate::error::{PipelineError, Result};
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use axum::http::StatusCode;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Multipart field carrying the image
pub const UPLOAD_FIELD: &str = "image";

pub const ALLOWED_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "gif"];

pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/gif"];

/// An accepted upload persisted in the scratch directory.
///
/// Owned by exactly one request. The reclaimer consumes it, so it cannot be
/// referenced after its file is deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedAsset {
    pub temporary_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Lowercased extension of `file_name` if it is on the allow-list.
pub fn allowed_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Whether the declared media type is on the allow-list. Parameters such as
/// `; charset=...` are ignored.
pub fn mime_allowed(mime_type: &str) -> bool {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ALLOWED_MIME_TYPES.contains(&essence.as_str())
}

/// Both checks must pass; each is evaluated on its own.
pub fn validate_upload(file_name: &str, mime_type: &str) -> Result<String> {
    let extension = allowed_extension(file_name);
    let mime_ok = mime_allowed(mime_type);

    match extension {
        Some(ext) if mime_ok => Ok(ext),
        _ => Err(PipelineError::UnsupportedMediaType {
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
        }),
    }
}

/// Scratch directory plus the per-upload size ceiling.
#[derive(Debug, Clone)]
pub struct UploadIntake {
    scratch_dir: PathBuf,
    max_upload_bytes: usize,
}

impl UploadIntake {
    pub fn new(scratch_dir: impl Into<PathBuf>, max_upload_bytes: usize) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            max_upload_bytes,
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Pull the `image` field out of a multipart body and persist it.
    pub async fn receive_multipart(&self, mut multipart: Multipart) -> Result<UploadedAsset> {
        loop {
            let field = multipart
                .next_field()
                .await
                .map_err(|e| self.multipart_error(e))?;

            let Some(field) = field else {
                return Err(PipelineError::NoFileProvided);
            };

            // a field without a filename is a plain form value, not a file
            if field.name() != Some(UPLOAD_FIELD) || field.file_name().is_none() {
                debug!(field = ?field.name(), "Skipping non-file multipart field");
                continue;
            }

            return self.persist_field(field).await;
        }
    }

    async fn persist_field(&self, mut field: Field<'_>) -> Result<UploadedAsset> {
        let original_name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let extension = validate_upload(&original_name, &mime_type)?;
        let mut pending = PendingFile::create(&self.scratch_dir, &extension).await?;

        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    pending.abort().await;
                    return Err(self.multipart_error(e));
                }
            };
            if let Err(e) = self.append(&mut pending, &chunk).await {
                pending.abort().await;
                return Err(e);
            }
        }

        pending.finish(original_name, mime_type).await
    }

    /// Persist an in-memory payload. Same validation and naming as the
    /// multipart path.
    pub async fn persist_bytes(
        &self,
        original_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<UploadedAsset> {
        let extension = validate_upload(original_name, mime_type)?;
        let mut pending = PendingFile::create(&self.scratch_dir, &extension).await?;

        if let Err(e) = self.append(&mut pending, bytes).await {
            pending.abort().await;
            return Err(e);
        }

        pending
            .finish(original_name.to_string(), mime_type.to_string())
            .await
    }

    async fn append(&self, pending: &mut PendingFile, chunk: &[u8]) -> Result<()> {
        if pending.written + chunk.len() as u64 > self.max_upload_bytes as u64 {
            return Err(PipelineError::PayloadTooLarge {
                limit: self.max_upload_bytes,
            });
        }
        pending.write(chunk).await
    }

    fn multipart_error(&self, err: MultipartError) -> PipelineError {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            PipelineError::PayloadTooLarge {
                limit: self.max_upload_bytes,
            }
        } else {
            PipelineError::InvalidUpload(err.body_text())
        }
    }
}

/// `<unix-millis>-<random>.<ext>`
fn unique_file_name(extension: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random_range(0..1_000_000_000);
    format!("{}-{}.{}", millis, suffix, extension)
}

/// A scratch file being written. Removed again unless `finish` is reached.
struct PendingFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl PendingFile {
    async fn create(scratch_dir: &Path, extension: &str) -> Result<Self> {
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|source| PipelineError::WriteFailed {
                path: scratch_dir.to_path_buf(),
                source,
            })?;

        let path = scratch_dir.join(unique_file_name(extension));
        // create_new: never clobber a concurrent upload
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| PipelineError::WriteFailed {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|source| PipelineError::WriteFailed {
                path: self.path.clone(),
                source,
            })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self, original_name: String, mime_type: String) -> Result<UploadedAsset> {
        if let Err(source) = self.file.flush().await {
            let path = self.path.clone();
            self.abort().await;
            return Err(PipelineError::WriteFailed { path, source });
        }

        debug!(
            path = %self.path.display(),
            size_bytes = self.written,
            original_name = %original_name,
            "Upload persisted"
        );

        Ok(UploadedAsset {
            temporary_path: self.path,
            original_name,
            mime_type,
            size_bytes: self.written,
        })
    }

    async fn abort(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to remove partial upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_allow_list() {
        assert_eq!(allowed_extension("tower.JPG"), Some("jpg".to_string()));
        assert_eq!(allowed_extension("a.b.png"), Some("png".to_string()));
        assert_eq!(allowed_extension("notes.txt"), None);
        assert_eq!(allowed_extension("no_extension"), None);
    }

    #[test]
    fn test_mime_allow_list() {
        assert!(mime_allowed("image/jpeg"));
        assert!(mime_allowed("IMAGE/PNG; charset=binary"));
        assert!(!mime_allowed("text/plain"));
        assert!(!mime_allowed("image/webp"));
        assert!(!mime_allowed(""));
    }

    #[test]
    fn test_checks_fail_independently() {
        // spoofed media type on a text file
        assert!(matches!(
            validate_upload("notes.txt", "image/png"),
            Err(PipelineError::UnsupportedMediaType { .. })
        ));
        // image extension with a non-image media type
        assert!(matches!(
            validate_upload("tower.png", "text/plain"),
            Err(PipelineError::UnsupportedMediaType { .. })
        ));
        assert_eq!(validate_upload("tower.gif", "image/gif").unwrap(), "gif");
    }

    #[test]
    fn test_unique_file_names_differ() {
        let a = unique_file_name("png");
        let b = unique_file_name("png");
        assert!(a.ends_with(".png"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_persist_creates_scratch_dir_on_first_use() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("nested").join("uploads");
        let intake = UploadIntake::new(&scratch, 1024);

        let asset = intake
            .persist_bytes("tower.jpg", "image/jpeg", b"fake-jpeg")
            .await
            .unwrap();

        assert!(scratch.is_dir());
        assert!(asset.temporary_path.starts_with(&scratch));
        assert_eq!(asset.size_bytes, 9);
        assert_eq!(asset.original_name, "tower.jpg");
        assert_eq!(tokio::fs::read(&asset.temporary_path).await.unwrap(), b"fake-jpeg");
    }

    #[tokio::test]
    async fn test_rejected_upload_never_touches_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("uploads");
        let intake = UploadIntake::new(&scratch, 1024);

        let result = intake.persist_bytes("payload.txt", "image/png", b"hello").await;

        assert!(matches!(result, Err(PipelineError::UnsupportedMediaType { .. })));
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_oversized_upload_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let intake = UploadIntake::new(tmp.path(), 4);

        let result = intake.persist_bytes("big.png", "image/png", b"0123456789").await;

        assert!(matches!(result, Err(PipelineError::PayloadTooLarge { limit: 4 })));
        let leftovers = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
