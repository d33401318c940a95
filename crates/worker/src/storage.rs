//! Filesystem image store and a logging canvas sink.

use std::path::PathBuf;

use async_trait::async_trait;
use canvasgen_core::job::Job;
use canvasgen_core::types::JobId;
use canvasgen_queue::collaborators::{CanvasError, CanvasSink, ImageStore, StoreError};

/// Writes images as `{dir}/{job_id}-{index}.png`.
#[derive(Debug, Clone)]
pub struct FsImageStore {
    dir: PathBuf,
}

impl FsImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn store(&self, job_id: JobId, index: usize, bytes: &[u8]) -> Result<String, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{job_id}-{index}.png"));
        tokio::fs::write(&path, bytes).await?;

        tracing::debug!(job_id = %job_id, path = %path.display(), size = bytes.len(), "Image stored");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Canvas sink for headless runs: records each insertion in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCanvas;

#[async_trait]
impl CanvasSink for LogCanvas {
    async fn insert(&self, job: &Job, image_ref: &str) -> Result<(), CanvasError> {
        tracing::info!(job_id = %job.id, kind = %job.kind, image = image_ref, "Image ready for canvas");
        Ok(())
    }
}
