//! Test doubles for the queue's collaborators.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canvasgen_client::api::SdApi;
use canvasgen_client::client::SocketClient;
use canvasgen_client::polling::{PollingConfig, PollingProgressMonitor};
use canvasgen_client::reconnect::ReconnectPolicy;
use canvasgen_client::service::ProgressService;
use canvasgen_client::socket::SocketProgressMonitor;
use canvasgen_core::generation::{GenerationApi, GenerationError, GenerationOutput};
use canvasgen_core::job::{Job, JobKind};
use canvasgen_core::types::{JobId, Params};
use canvasgen_queue::collaborators::{CanvasError, CanvasSink, ImageStore, StoreError};
use canvasgen_queue::events::QueueEvent;
use canvasgen_queue::queue::{JobQueue, QueueConfig};
use tokio::sync::broadcast;

/// `"hello"` base64-encoded.
pub const FAKE_IMAGE: &str = "aGVsbG8=";

// ---------------------------------------------------------------------------
// Generation API
// ---------------------------------------------------------------------------

/// Answers from a script, then succeeds with one image.
#[derive(Default)]
pub struct ScriptedApi {
    responses: Mutex<VecDeque<Result<GenerationOutput, GenerationError>>>,
    calls: Mutex<Vec<(JobKind, Params)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, images: &[&str]) {
        self.responses.lock().unwrap().push_back(Ok(GenerationOutput {
            images: images.iter().map(|s| s.to_string()).collect(),
        }));
    }

    pub fn push_err(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(GenerationError::Transport(message.to_string())));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<(JobKind, Params)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationApi for ScriptedApi {
    async fn submit(
        &self,
        kind: JobKind,
        params: &Params,
    ) -> Result<GenerationOutput, GenerationError> {
        self.calls.lock().unwrap().push((kind, params.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(GenerationOutput {
                    images: vec![FAKE_IMAGE.to_string()],
                })
            })
    }
}

// ---------------------------------------------------------------------------
// Image store and canvas
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    pub stored: Mutex<Vec<(JobId, usize, Vec<u8>)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn store(&self, job_id: JobId, index: usize, bytes: &[u8]) -> Result<String, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("disk full".into()));
        }
        self.stored
            .lock()
            .unwrap()
            .push((job_id, index, bytes.to_vec()));
        Ok(format!("mem://{job_id}/{index}"))
    }
}

#[derive(Default)]
pub struct RecordingCanvas {
    pub inserted: Mutex<Vec<(JobId, String)>>,
}

#[async_trait]
impl CanvasSink for RecordingCanvas {
    async fn insert(&self, job: &Job, image_ref: &str) -> Result<(), CanvasError> {
        self.inserted
            .lock()
            .unwrap()
            .push((job.id, image_ref.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue construction
// ---------------------------------------------------------------------------

pub struct Harness {
    pub queue: JobQueue,
    pub api: Arc<ScriptedApi>,
    pub store: Arc<MemoryStore>,
    pub canvas: Arc<RecordingCanvas>,
}

/// Short delays so retries and hand-offs happen quickly.
pub fn fast_config() -> QueueConfig {
    QueueConfig {
        auto_start: true,
        retry_delay: Duration::from_millis(50),
        next_job_delay: Duration::from_millis(5),
        default_max_retries: 2,
    }
}

/// A progress service left on the `none` transport.
pub fn idle_progress() -> Arc<ProgressService> {
    let socket = SocketProgressMonitor::new(
        SocketClient::from_url("ws://127.0.0.1:9/ws"),
        ReconnectPolicy::default(),
    );
    let polling = PollingProgressMonitor::new(
        Arc::new(SdApi::new("http://127.0.0.1:9/sdapi/v1".to_string())),
        PollingConfig::default(),
    );
    Arc::new(ProgressService::new(socket, polling))
}

pub fn harness(config: QueueConfig) -> Harness {
    let api = ScriptedApi::new();
    let store = Arc::new(MemoryStore::default());
    let canvas = Arc::new(RecordingCanvas::default());
    let queue = JobQueue::new(
        config,
        api.clone(),
        idle_progress(),
        store.clone(),
        canvas.clone(),
    );
    Harness {
        queue,
        api,
        store,
        canvas,
    }
}

pub fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Everything currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait for the queue to go idle, failing the test after 5 s.
pub async fn settle(queue: &JobQueue) {
    tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
        .await
        .expect("queue did not go idle");
}
