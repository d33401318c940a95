//! The JSON document the worker reads from stdin.
//!
//! ```json
//! {
//!   "progress_mode": "polling",
//!   "jobs": [
//!     { "kind": "text-to-image", "params": { "prompt": "a fox", "seed": 5 },
//!       "batch": { "count": 3, "seed": { "enabled": true, "source": { "mode": "step", "value": 2 } } } }
//!   ]
//! }
//! ```
//!
//! A single job object without the `jobs` wrapper is accepted too.

use canvasgen_client::service::TransportMode;
use canvasgen_core::batch::BatchSpec;
use canvasgen_core::job::JobKind;
use canvasgen_core::types::{JobId, Params};
use canvasgen_queue::queue::{JobQueue, QueueError};
use serde::Deserialize;

/// One submitted action; expands into several jobs when `batch` is set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub batch: Option<BatchSpec>,
}

impl JobRequest {
    /// Enqueue this request, returning the ids of the created jobs.
    pub fn submit(&self, queue: &JobQueue) -> Result<Vec<JobId>, QueueError> {
        match &self.batch {
            Some(spec) => queue.enqueue_batch(&self.params, self.kind, spec),
            None => Ok(vec![queue.enqueue(self.kind, self.params.clone())?]),
        }
    }
}

/// A full worker request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerRequest {
    /// Persist a new progress transport before running.
    #[serde(default)]
    pub progress_mode: Option<TransportMode>,
    pub jobs: Vec<JobRequest>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequestDocument {
    Full(WorkerRequest),
    Single(JobRequest),
}

/// Parse stdin contents into a [`WorkerRequest`].
pub fn parse_request(input: &str) -> Result<WorkerRequest, serde_json::Error> {
    Ok(match serde_json::from_str(input)? {
        RequestDocument::Full(request) => request,
        RequestDocument::Single(job) => WorkerRequest {
            progress_mode: None,
            jobs: vec![job],
        },
    })
}
