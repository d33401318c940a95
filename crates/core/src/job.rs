//! Generation job model and lifecycle transitions.
//!
//! A [`Job`] is one generation request tracked by the queue. Status
//! changes go through the `mark_*` methods so that timestamps, error
//! text and retry bookkeeping stay consistent with the status.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Params, Timestamp};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Automatic retries granted to a job when none is specified.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// Job kind
// ---------------------------------------------------------------------------

/// The generation operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    TextToImage,
    ImageToImage,
    Inpaint,
}

impl JobKind {
    /// Wire name, e.g. `"text-to-image"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text-to-image",
            Self::ImageToImage => "image-to-image",
            Self::Inpaint => "inpaint",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text-to-image" => Ok(Self::TextToImage),
            "image-to-image" => Ok(Self::ImageToImage),
            "inpaint" => Ok(Self::Inpaint),
            other => Err(CoreError::Validation(format!(
                "Unknown job kind '{other}'. Must be one of: text-to-image, image-to-image, inpaint"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the processor to pick it up.
    Pending,
    /// Submitted to the generation server; at most one job at a time.
    Processing,
    Completed,
    Failed,
    /// Cancelled by the user. An in-flight request is not interrupted.
    Cancelled,
}

impl JobStatus {
    /// Human-readable label for display.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether the processor will never touch a job in this status again
    /// without an explicit user action.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One generation request tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Parameters passed verbatim to the generation API.
    pub params: Params,
    /// Reference to the first stored output image.
    pub result: Option<String>,
    /// References to every stored output image, in API order.
    #[serde(default)]
    pub images: Vec<String>,
    pub error: Option<String>,
    /// Last observed progress (0-100) while processing.
    pub progress_percent: Option<u8>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Job {
    /// Create a pending job with [`DEFAULT_MAX_RETRIES`].
    pub fn new(kind: JobKind, params: Params) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            status: JobStatus::Pending,
            params,
            result: None,
            images: Vec::new(),
            error: None,
            progress_percent: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the automatic retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether an automatic retry is still allowed after a failure.
    pub fn can_auto_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// `pending -> processing`.
    pub fn mark_processing(&mut self) -> Result<(), CoreError> {
        self.expect_status(&[JobStatus::Pending], "start")?;
        self.status = JobStatus::Processing;
        self.started_at = Some(chrono::Utc::now());
        self.progress_percent = Some(0);
        Ok(())
    }

    /// `processing -> completed`, recording the stored image references.
    pub fn mark_completed(&mut self, images: Vec<String>) -> Result<(), CoreError> {
        self.expect_status(&[JobStatus::Processing], "complete")?;
        self.status = JobStatus::Completed;
        self.result = images.first().cloned();
        self.images = images;
        self.error = None;
        self.progress_percent = Some(100);
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `processing -> failed`.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.expect_status(&[JobStatus::Processing], "fail")?;
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `pending | processing -> cancelled`.
    pub fn mark_cancelled(&mut self) -> Result<(), CoreError> {
        self.expect_status(&[JobStatus::Pending, JobStatus::Processing], "cancel")?;
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `failed -> pending`, consuming one retry.
    pub fn reset_for_retry(&mut self) -> Result<(), CoreError> {
        self.expect_status(&[JobStatus::Failed], "retry")?;
        self.status = JobStatus::Pending;
        self.retry_count += 1;
        self.error = None;
        self.progress_percent = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    fn expect_status(&self, allowed: &[JobStatus], action: &str) -> Result<(), CoreError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition(format!(
                "Cannot {action} job {} in status '{}'",
                self.id,
                self.status.label()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
