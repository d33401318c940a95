//! Interfaces to the systems the queue hands results to.

use async_trait::async_trait;
use canvasgen_core::job::Job;
use canvasgen_core::types::JobId;

/// Persistent storage for generated images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store one decoded image and return a reference to it.
    ///
    /// `index` is the image's position in the generation response.
    async fn store(&self, job_id: JobId, index: usize, bytes: &[u8]) -> Result<String, StoreError>;
}

/// Receives finished images for placement on the canvas.
#[async_trait]
pub trait CanvasSink: Send + Sync {
    async fn insert(&self, job: &Job, image_ref: &str) -> Result<(), CanvasError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Image store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image store rejected image: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("Canvas insertion failed: {0}")]
    Rejected(String),
}
