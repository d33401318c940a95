//! The job queue and its single-worker processor.
//!
//! Jobs are kept in insertion order. The processor claims the first
//! `pending` job, runs it to completion, waits
//! [`QueueConfig::next_job_delay`], and repeats until nothing is pending.
//! At most one processor runs at a time, so at most one job is ever
//! `processing`.
//!
//! Cancellation is cooperative. [`JobQueue::cancel`] marks the job and
//! fires its [`CancellationToken`], which is checked before the request is
//! sent and before an automatic retry. A request already in flight is not
//! interrupted: its images are still stored and inserted, and the job
//! keeps its `cancelled` status.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use canvasgen_client::monitor::Subscription;
use canvasgen_client::service::ProgressService;
use canvasgen_core::batch::{expand_batch, BatchSpec};
use canvasgen_core::error::CoreError;
use canvasgen_core::generation::{GenerationApi, GenerationError};
use canvasgen_core::job::{Job, JobKind, JobStatus, DEFAULT_MAX_RETRIES};
use canvasgen_core::progress::ProgressEvent;
use canvasgen_core::types::{JobId, Params};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{CanvasError, CanvasSink, ImageStore, StoreError};
use crate::events::QueueEvent;
use crate::images::{decode_image, DecodeError};

/// Broadcast channel capacity for queue events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Queue behavior and timing.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Start processing as soon as a job is enqueued.
    pub auto_start: bool,
    /// Delay before a failed job is automatically retried.
    pub retry_delay: Duration,
    /// Pause between finishing one job and claiming the next.
    pub next_job_delay: Duration,
    /// Retry budget for jobs created by [`JobQueue::enqueue`].
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            retry_delay: Duration::from_secs(2),
            next_job_delay: Duration::from_millis(100),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Direction for [`JobQueue::reorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(format!("Unknown direction: {other}")),
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// The job is not in a status that allows the operation.
    #[error("Cannot {action} job {id} while it is {status}")]
    InvalidState {
        id: JobId,
        status: &'static str,
        action: &'static str,
    },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Queue has been shut down")]
    ShutDown,
}

/// Why a job failed. Recorded on the job as its error message.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Generation returned no images")]
    NoImages,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Shared handle to the queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    api: Arc<dyn GenerationApi>,
    progress: Arc<ProgressService>,
    store: Arc<dyn ImageStore>,
    canvas: Arc<dyn CanvasSink>,
    state: Mutex<QueueState>,
    /// Set while a processor task is running.
    processing: AtomicBool,
    /// Automatic retries waiting on their delay.
    scheduled_retries: AtomicUsize,
    events: broadcast::Sender<QueueEvent>,
    idle: Notify,
    shutdown: CancellationToken,
    progress_subscription: Mutex<Option<Subscription>>,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    tokens: HashMap<JobId, CancellationToken>,
    /// The job whose request is in flight.
    active: Option<JobId>,
}

impl QueueState {
    fn position(&self, id: JobId) -> Result<usize, QueueError> {
        self.jobs
            .iter()
            .position(|job| job.id == id)
            .ok_or(QueueError::NotFound(id))
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    fn has_pending(&self) -> bool {
        self.jobs.iter().any(|job| job.status == JobStatus::Pending)
    }

    fn remove_where(&mut self, keep: impl Fn(&Job) -> bool) -> Vec<JobId> {
        let mut removed = Vec::new();
        self.jobs.retain(|job| {
            if keep(job) {
                true
            } else {
                removed.push(job.id);
                false
            }
        });
        for id in &removed {
            if let Some(token) = self.tokens.remove(id) {
                token.cancel();
            }
        }
        removed
    }
}

/// A job taken by the processor.
struct Claim {
    job: Job,
    token: CancellationToken,
}

impl JobQueue {
    /// Create a queue and subscribe it to `progress`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: QueueConfig,
        api: Arc<dyn GenerationApi>,
        progress: Arc<ProgressService>,
        store: Arc<dyn ImageStore>,
        canvas: Arc<dyn CanvasSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            api,
            progress,
            store,
            canvas,
            state: Mutex::new(QueueState::default()),
            processing: AtomicBool::new(false),
            scheduled_retries: AtomicUsize::new(0),
            events,
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
            progress_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.progress.subscribe(Arc::new(move |event: &ProgressEvent| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_progress(event);
            }
        }));
        *inner.progress_subscription.lock() = Some(subscription);

        Self { inner }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Append a new job built from `kind` and `params`.
    pub fn enqueue(&self, kind: JobKind, params: Params) -> Result<JobId, QueueError> {
        let job = Job::new(kind, params).with_max_retries(self.inner.config.default_max_retries);
        self.enqueue_job(job)
    }

    /// Append a prepared job. It must be `pending`.
    pub fn enqueue_job(&self, job: Job) -> Result<JobId, QueueError> {
        let id = job.id;
        self.append(vec![job])?;
        Ok(id)
    }

    /// Expand `spec` over `base` and append every resulting job at once.
    pub fn enqueue_batch(
        &self,
        base: &Params,
        kind: JobKind,
        spec: &BatchSpec,
    ) -> Result<Vec<JobId>, QueueError> {
        let max_retries = self.inner.config.default_max_retries;
        let jobs: Vec<Job> = expand_batch(base, spec)?
            .into_iter()
            .map(|params| Job::new(kind, params).with_max_retries(max_retries))
            .collect();
        let ids = jobs.iter().map(|job| job.id).collect();
        self.append(jobs)?;
        Ok(ids)
    }

    /// Swap a pending job with the nearest pending job in `direction`.
    ///
    /// Returns `false` when there is no pending neighbor to swap with.
    pub fn reorder(&self, id: JobId, direction: Direction) -> Result<bool, QueueError> {
        let mut state = self.inner.state.lock();
        let index = state.position(id)?;
        let status = state.jobs[index].status;
        if status != JobStatus::Pending {
            return Err(QueueError::InvalidState {
                id,
                status: status.label(),
                action: "reorder",
            });
        }

        let is_pending = |job: &Job| job.status == JobStatus::Pending;
        let neighbor = match direction {
            Direction::Up => state.jobs[..index].iter().rposition(is_pending),
            Direction::Down => state.jobs[index + 1..]
                .iter()
                .position(is_pending)
                .map(|offset| index + 1 + offset),
        };
        let Some(neighbor) = neighbor else {
            return Ok(false);
        };

        state.jobs.swap(index, neighbor);
        self.inner.emit(QueueEvent::Reordered { job_id: id, direction });
        Ok(true)
    }

    /// Cancel a pending or processing job.
    ///
    /// Returns `false` when the job had already finished. An in-flight
    /// request for a processing job still runs to completion.
    pub fn cancel(&self, id: JobId) -> Result<bool, QueueError> {
        let mut state = self.inner.state.lock();
        let index = state.position(id)?;
        let job = &mut state.jobs[index];
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            return Ok(false);
        }
        let was_processing = job.status == JobStatus::Processing;
        job.mark_cancelled()?;
        if let Some(token) = state.tokens.get(&id) {
            token.cancel();
        }

        tracing::info!(job_id = %id, was_processing, "Job cancelled");
        self.inner.emit(QueueEvent::Cancelled { job_id: id });
        Ok(true)
    }

    /// Put a failed job back to `pending`, consuming a retry.
    ///
    /// Allowed even after the automatic retry budget is spent.
    pub fn retry(&self, id: JobId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock();
            let index = state.position(id)?;
            let job = &mut state.jobs[index];
            if job.status != JobStatus::Failed {
                return Err(QueueError::InvalidState {
                    id,
                    status: job.status.label(),
                    action: "retry",
                });
            }
            job.reset_for_retry()?;
            let retry_count = job.retry_count;

            tracing::info!(job_id = %id, retry_count, "Job retried manually");
            self.inner.emit(QueueEvent::Retried {
                job_id: id,
                retry_count,
                automatic: false,
            });
        }

        if self.inner.config.auto_start {
            self.inner.trigger();
        }
        Ok(())
    }

    /// Remove a job that is not processing.
    pub fn remove(&self, id: JobId) -> Result<Job, QueueError> {
        let mut state = self.inner.state.lock();
        let index = state.position(id)?;
        let status = state.jobs[index].status;
        if status == JobStatus::Processing {
            return Err(QueueError::InvalidState {
                id,
                status: status.label(),
                action: "remove",
            });
        }

        let job = state.jobs.remove(index);
        if let Some(token) = state.tokens.remove(&id) {
            token.cancel();
        }
        self.inner.emit(QueueEvent::Removed { job_ids: vec![id] });
        Ok(job)
    }

    /// Remove every job that is not processing. Returns how many were
    /// removed.
    pub fn clear_queue(&self) -> usize {
        self.remove_where(|job| job.status == JobStatus::Processing)
    }

    /// Remove every completed job. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        self.remove_where(|job| job.status != JobStatus::Completed)
    }

    /// Snapshot of every job in queue order.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.state.lock().jobs.clone()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner
            .state
            .lock()
            .jobs
            .iter()
            .find(|job| job.id == id)
            .cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let mut stats = QueueStats::default();
        for job in &state.jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Start the processor if it is not already running. Needed only when
    /// `auto_start` is off.
    pub fn start(&self) {
        self.inner.trigger();
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Subscribe to queue lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the processor has stopped and no automatic retry is
    /// scheduled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop claiming jobs, drop scheduled retries, wait for the in-flight
    /// job to settle, and detach from the progress service.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job queue");
        self.inner.shutdown.cancel();
        self.wait_idle().await;

        if let Some(subscription) = self.inner.progress_subscription.lock().take() {
            subscription.unsubscribe();
        }
        tracing::info!("Job queue shut down complete");
    }

    // ---- private helpers ----

    fn append(&self, jobs: Vec<Job>) -> Result<(), QueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        if let Some(job) = jobs.iter().find(|job| job.status != JobStatus::Pending) {
            return Err(QueueError::InvalidState {
                id: job.id,
                status: job.status.label(),
                action: "enqueue",
            });
        }

        let job_ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
        {
            let mut state = self.inner.state.lock();
            for job in jobs {
                state.tokens.insert(job.id, CancellationToken::new());
                state.jobs.push(job);
            }
        }

        tracing::info!(count = job_ids.len(), "Jobs enqueued");
        self.inner.emit(QueueEvent::Enqueued { job_ids });

        if self.inner.config.auto_start {
            self.inner.trigger();
        }
        Ok(())
    }

    fn remove_where(&self, keep: impl Fn(&Job) -> bool) -> usize {
        let removed = self.inner.state.lock().remove_where(keep);
        let count = removed.len();
        if count > 0 {
            self.inner.emit(QueueEvent::Removed { job_ids: removed });
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

impl Inner {
    fn emit(&self, event: QueueEvent) {
        // Ignore the SendError: it only means there are no receivers.
        let _ = self.events.send(event);
    }

    fn is_idle(&self) -> bool {
        !self.processing.load(Ordering::SeqCst)
            && self.scheduled_retries.load(Ordering::SeqCst) == 0
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Spawn the processor unless one is already running.
    fn trigger(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_processor().await;
        });
    }

    /// Claim -> execute -> pause, until nothing is pending.
    async fn run_processor(self: Arc<Self>) {
        tracing::debug!("Queue processor started");

        loop {
            let Some(claim) = self.claim_next() else {
                self.processing.store(false, Ordering::SeqCst);
                // A job may have become pending after the empty claim.
                let resume = !self.shutdown.is_cancelled()
                    && self.state.lock().has_pending()
                    && !self.processing.swap(true, Ordering::SeqCst);
                if resume {
                    continue;
                }
                break;
            };

            self.execute(claim).await;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.processing.store(false, Ordering::SeqCst);
                    break;
                }
                _ = tokio::time::sleep(self.config.next_job_delay) => {}
            }
        }

        tracing::debug!("Queue processor stopped");
        self.emit(QueueEvent::Drained);
        self.notify_if_idle();
    }

    /// Mark the first pending job `processing` and hand it out.
    fn claim_next(&self) -> Option<Claim> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let mut state = self.state.lock();
        let index = state
            .jobs
            .iter()
            .position(|job| job.status == JobStatus::Pending)?;
        let job = &mut state.jobs[index];
        if let Err(e) = job.mark_processing() {
            tracing::error!(job_id = %job.id, error = %e, "Failed to claim job");
            return None;
        }
        let job = job.clone();
        let token = state.tokens.entry(job.id).or_default().clone();
        state.active = Some(job.id);

        self.emit(QueueEvent::Started { job_id: job.id });
        Some(Claim { job, token })
    }

    async fn execute(self: &Arc<Self>, claim: Claim) {
        let Claim { job, token } = claim;
        let id = job.id;

        if token.is_cancelled() {
            tracing::info!(job_id = %id, "Job cancelled before submission");
            self.state.lock().active = None;
            return;
        }

        let job_key = id.to_string();
        self.progress.start_for_job(Some(&job_key));
        tracing::info!(
            job_id = %id,
            kind = %job.kind,
            retry_count = job.retry_count,
            transport = self.progress.active_transport_name(),
            "Submitting generation job",
        );

        match self.produce(&job).await {
            Ok(images) => {
                self.record_success(id, images);
                self.progress.stop_polling(true);
            }
            Err(e) => {
                let retry_from = self.record_failure(id, &e, &token);
                self.progress.stop_polling(false);
                if let Some(retry_count) = retry_from {
                    self.schedule_retry(id, retry_count, token);
                }
            }
        }

        self.state.lock().active = None;
    }

    /// Submit the job, then decode, store and insert every image.
    async fn produce(&self, job: &Job) -> Result<Vec<String>, ExecutionError> {
        let output = self.api.submit(job.kind, &job.params).await?;
        if output.images.is_empty() {
            return Err(ExecutionError::NoImages);
        }

        let mut refs = Vec::with_capacity(output.images.len());
        for (index, payload) in output.images.iter().enumerate() {
            let bytes = decode_image(payload)?;
            refs.push(self.store.store(job.id, index, &bytes).await?);
        }
        for image_ref in &refs {
            self.canvas.insert(job, image_ref).await?;
        }
        Ok(refs)
    }

    fn record_success(&self, id: JobId, images: Vec<String>) {
        let mut state = self.state.lock();
        let Some(job) = state.job_mut(id) else {
            tracing::warn!(job_id = %id, "Finished job was removed from the queue");
            return;
        };

        if job.status == JobStatus::Cancelled {
            // The request was already in flight when the job was cancelled.
            tracing::info!(job_id = %id, "Cancelled job finished anyway, keeping its result");
            job.result = images.first().cloned();
            job.images = images;
            return;
        }

        if let Err(e) = job.mark_completed(images.clone()) {
            tracing::error!(job_id = %id, error = %e, "Failed to complete job");
            return;
        }
        tracing::info!(job_id = %id, images = images.len(), "Job completed");
        self.emit(QueueEvent::Completed { job_id: id, images });
    }

    /// Returns the job's retry count when an automatic retry should be
    /// scheduled for this failure.
    fn record_failure(
        &self,
        id: JobId,
        error: &ExecutionError,
        token: &CancellationToken,
    ) -> Option<u32> {
        let mut state = self.state.lock();
        let Some(job) = state.job_mut(id) else {
            tracing::warn!(job_id = %id, error = %error, "Failed job was removed from the queue");
            return None;
        };

        if job.status == JobStatus::Cancelled {
            tracing::info!(job_id = %id, error = %error, "Cancelled job failed");
            return None;
        }

        if let Err(e) = job.mark_failed(error.to_string()) {
            tracing::error!(job_id = %id, error = %e, "Failed to record job failure");
            return None;
        }

        let will_retry = job.can_auto_retry() && !token.is_cancelled();
        tracing::warn!(
            job_id = %id,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            will_retry,
            error = %error,
            "Job failed",
        );
        let retry_count = job.retry_count;
        self.emit(QueueEvent::Failed {
            job_id: id,
            error: error.to_string(),
            will_retry,
        });
        will_retry.then_some(retry_count)
    }

    /// Retry `id` after the configured delay, provided it is still the
    /// failure seen at `retry_count`.
    fn schedule_retry(self: &Arc<Self>, id: JobId, retry_count: u32, token: CancellationToken) {
        self.scheduled_retries.fetch_add(1, Ordering::SeqCst);
        let delay = self.config.retry_delay;
        tracing::info!(job_id = %id, delay_ms = delay.as_millis() as u64, "Scheduling automatic retry");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let fire = tokio::select! {
                _ = inner.shutdown.cancelled() => false,
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if fire {
                inner.auto_retry(id, retry_count, &token);
            }
            inner.scheduled_retries.fetch_sub(1, Ordering::SeqCst);
            inner.notify_if_idle();
        });
    }

    fn auto_retry(self: &Arc<Self>, id: JobId, scheduled_at: u32, token: &CancellationToken) {
        {
            let mut state = self.state.lock();
            let Some(job) = state.job_mut(id) else {
                return;
            };
            // Any retry since scheduling bumps the count and owns the job now.
            if job.status != JobStatus::Failed
                || job.retry_count != scheduled_at
                || token.is_cancelled()
            {
                tracing::debug!(job_id = %id, "Dropping stale automatic retry");
                return;
            }
            if let Err(e) = job.reset_for_retry() {
                tracing::error!(job_id = %id, error = %e, "Automatic retry failed");
                return;
            }
            let retry_count = job.retry_count;
            tracing::info!(job_id = %id, retry_count, "Job retried automatically");
            self.emit(QueueEvent::Retried {
                job_id: id,
                retry_count,
                automatic: true,
            });
        }
        self.trigger();
    }

    /// Record progress on the running job.
    fn on_progress(&self, event: &ProgressEvent) {
        let mut state = self.state.lock();
        let Some(id) = state.active else {
            return;
        };
        let Some(job) = state.job_mut(id) else {
            return;
        };
        if job.status != JobStatus::Processing {
            return;
        }

        let percent = event.percent();
        job.progress_percent = Some(percent);
        self.emit(QueueEvent::Progress {
            job_id: id,
            percent,
            phase: event.phase,
        });
    }
}
