//! Lifecycle notifications published by the job queue.
//!
//! Delivered over a [`tokio::sync::broadcast`] channel; see
//! [`JobQueue::subscribe`](crate::queue::JobQueue::subscribe). Slow
//! receivers observe `RecvError::Lagged` rather than blocking the queue.

use canvasgen_core::progress::Phase;
use canvasgen_core::types::JobId;
use serde::Serialize;

use crate::queue::Direction;

/// A state change in the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Jobs were appended (one event per enqueue or batch).
    Enqueued { job_ids: Vec<JobId> },

    /// A job moved to `processing` and its request is about to be sent.
    Started { job_id: JobId },

    /// The running job reported progress.
    Progress {
        job_id: JobId,
        /// Completion percentage (0-100).
        percent: u8,
        phase: Phase,
    },

    /// A job finished and its images were stored and inserted.
    Completed { job_id: JobId, images: Vec<String> },

    /// A job's request or result handling failed.
    Failed {
        job_id: JobId,
        error: String,
        /// Whether an automatic retry was scheduled.
        will_retry: bool,
    },

    /// A job was cancelled by the user.
    Cancelled { job_id: JobId },

    /// A failed job was put back to `pending`.
    Retried {
        job_id: JobId,
        retry_count: u32,
        automatic: bool,
    },

    /// A pending job swapped places with a neighbor.
    Reordered { job_id: JobId, direction: Direction },

    /// Jobs were removed from the list.
    Removed { job_ids: Vec<JobId> },

    /// The processor ran out of pending jobs.
    Drained,
}
