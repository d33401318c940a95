//! In-process fake generation server for integration tests.
//!
//! Serves `GET /sdapi/v1/progress` from a scripted queue of snapshots
//! (idle once the queue is empty), `POST /sdapi/v1/txt2img|img2img` with a
//! fixed image, and a `/ws` socket that pushes scripted text frames to
//! every connection.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use canvasgen_core::progress::ProgressEvent;
use serde_json::{json, Value};

/// `"hello"` base64-encoded.
pub const FAKE_IMAGE: &str = "aGVsbG8=";

#[derive(Clone, Default)]
pub struct FakeState {
    snapshots: Arc<Mutex<VecDeque<Value>>>,
    progress_queries: Arc<Mutex<Vec<Option<String>>>>,
    generate_requests: Arc<Mutex<Vec<(&'static str, Value)>>>,
    frames: Arc<Mutex<Vec<String>>>,
    close_after_frames: Arc<AtomicBool>,
    socket_connections: Arc<AtomicUsize>,
}

pub struct FakeServer {
    pub addr: SocketAddr,
    state: FakeState,
}

impl FakeServer {
    pub async fn start() -> Self {
        let state = FakeState::default();
        let app = Router::new()
            .route("/sdapi/v1/progress", get(progress))
            .route("/sdapi/v1/txt2img", post(txt2img))
            .route("/sdapi/v1/img2img", post(img2img))
            .route("/ws", get(socket))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/sdapi/v1", self.addr)
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn push_snapshots(&self, snapshots: impl IntoIterator<Item = Value>) {
        self.state.snapshots.lock().unwrap().extend(snapshots);
    }

    pub fn progress_queries(&self) -> Vec<Option<String>> {
        self.state.progress_queries.lock().unwrap().clone()
    }

    pub fn generate_requests(&self) -> Vec<(&'static str, Value)> {
        self.state.generate_requests.lock().unwrap().clone()
    }

    /// Frames pushed to each socket connection right after it opens.
    pub fn set_frames(&self, frames: &[&str]) {
        *self.state.frames.lock().unwrap() = frames.iter().map(|f| f.to_string()).collect();
    }

    /// Close each socket connection once its frames are sent.
    pub fn close_after_frames(&self, close: bool) {
        self.state.close_after_frames.store(close, Ordering::SeqCst);
    }

    pub fn socket_connections(&self) -> usize {
        self.state.socket_connections.load(Ordering::SeqCst)
    }
}

/// Snapshot of a running job at `step` of `steps`.
pub fn active_snapshot(job: &str, step: i64, steps: i64) -> Value {
    json!({
        "state": {
            "job": job,
            "job_count": 1,
            "job_no": 0,
            "sampling_step": step,
            "sampling_steps": steps,
        },
        "progress": step as f64 / steps.max(1) as f64,
        "eta_relative": 1.5,
    })
}

pub fn idle_snapshot() -> Value {
    json!({
        "state": { "job": "", "job_count": 0, "job_no": 0, "sampling_step": 0, "sampling_steps": 0 },
        "progress": 0.0,
    })
}

/// A port with nothing listening on it.
pub async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Handler that records every event it sees.
pub fn recorder() -> (
    Arc<Mutex<Vec<ProgressEvent>>>,
    canvasgen_client::monitor::ProgressHandler,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let handler = Arc::new(move |event: &ProgressEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (events, handler)
}

/// Poll `cond` every 20 ms for up to 5 s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn progress(
    State(state): State<FakeState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state
        .progress_queries
        .lock()
        .unwrap()
        .push(query.get("job_id").cloned());
    let next = state.snapshots.lock().unwrap().pop_front();
    Json(next.unwrap_or_else(idle_snapshot))
}

async fn txt2img(State(state): State<FakeState>, Json(body): Json<Value>) -> Json<Value> {
    state
        .generate_requests
        .lock()
        .unwrap()
        .push(("txt2img", body));
    Json(json!({ "images": [FAKE_IMAGE] }))
}

async fn img2img(State(state): State<FakeState>, Json(body): Json<Value>) -> Json<Value> {
    state
        .generate_requests
        .lock()
        .unwrap()
        .push(("img2img", body));
    Json(json!({ "images": [FAKE_IMAGE] }))
}

async fn socket(ws: WebSocketUpgrade, State(state): State<FakeState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: FakeState) {
    state.socket_connections.fetch_add(1, Ordering::SeqCst);

    let frames = state.frames.lock().unwrap().clone();
    for frame in frames {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    if state.close_after_frames.load(Ordering::SeqCst) {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}
