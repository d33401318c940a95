//! Runs the queue against an in-process HTTP generation server with
//! polling progress.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use canvasgen_client::api::SdApi;
use canvasgen_client::client::SocketClient;
use canvasgen_client::polling::{PollingConfig, PollingProgressMonitor};
use canvasgen_client::reconnect::ReconnectPolicy;
use canvasgen_client::service::{ProgressService, TransportMode};
use canvasgen_client::socket::SocketProgressMonitor;
use canvasgen_core::job::{JobKind, JobStatus};
use canvasgen_queue::events::QueueEvent;
use canvasgen_queue::queue::JobQueue;
use serde_json::{json, Value};

use common::{drain, fast_config, params, settle, MemoryStore, RecordingCanvas, FAKE_IMAGE};

#[derive(Clone, Default)]
struct ServerState {
    busy: Arc<AtomicBool>,
    step: Arc<AtomicI64>,
    job_ids: Arc<Mutex<Vec<String>>>,
}

async fn progress(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    if let Some(id) = query.get("job_id") {
        state.job_ids.lock().unwrap().push(id.clone());
    }
    if !state.busy.load(Ordering::SeqCst) {
        return Json(json!({ "state": { "job": "", "job_count": 0 }, "progress": 0.0 }));
    }
    let step = (state.step.fetch_add(1, Ordering::SeqCst) + 1).min(19);
    Json(json!({
        "state": {
            "job": "",
            "job_count": 1,
            "job_no": 0,
            "sampling_step": step,
            "sampling_steps": 20,
        },
        "progress": step as f64 / 20.0,
    }))
}

async fn txt2img(State(state): State<ServerState>, Json(_body): Json<Value>) -> Json<Value> {
    state.step.store(0, Ordering::SeqCst);
    state.busy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    state.busy.store(false, Ordering::SeqCst);
    Json(json!({ "images": [FAKE_IMAGE] }))
}

// ---------------------------------------------------------------------------
// Test: progress from polling reaches the running job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn polled_progress_updates_running_job() {
    let state = ServerState::default();
    let app = Router::new()
        .route("/sdapi/v1/progress", get(progress))
        .route("/sdapi/v1/txt2img", post(txt2img))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let api = Arc::new(SdApi::new(format!("http://{addr}/sdapi/v1")));
    let progress = Arc::new(ProgressService::new(
        SocketProgressMonitor::new(
            SocketClient::new(&addr.to_string(), false),
            ReconnectPolicy::default(),
        ),
        PollingProgressMonitor::new(
            Arc::clone(&api),
            PollingConfig {
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(500),
            },
        ),
    ));
    assert_eq!(progress.configure(TransportMode::Polling).await, "polling");

    let store = Arc::new(MemoryStore::default());
    let canvas = Arc::new(RecordingCanvas::default());
    let queue = JobQueue::new(fast_config(), api, Arc::clone(&progress), store, canvas.clone());
    let mut rx = queue.subscribe();

    let id = queue
        .enqueue(JobKind::TextToImage, params(&[("prompt", json!("a lighthouse"))]))
        .unwrap();
    settle(&queue).await;

    let job = queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, Some(100));
    assert_eq!(canvas.inserted.lock().unwrap().len(), 1);

    let percents: Vec<u8> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::Progress { job_id, percent, .. } if job_id == id => Some(percent),
            _ => None,
        })
        .collect();
    assert!(percents.iter().any(|p| (1..100).contains(p)));

    let seen = state.job_ids.lock().unwrap().clone();
    assert!(seen.iter().all(|seen_id| *seen_id == id.to_string()));

    queue.shutdown().await;
    progress.shutdown().await;
}
