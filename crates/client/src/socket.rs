//! Progress monitoring over the persistent socket.
//!
//! [`SocketProgressMonitor::connect`] opens the socket and spawns a
//! session task that reads frames, dispatches them as
//! [`ProgressEvent`]s, and reconnects with exponential backoff when the
//! connection drops. After [`ReconnectPolicy::max_attempts`] failed reconnects
//! in a row the session gives up silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canvasgen_core::progress::ProgressEvent;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{SocketClient, WsStream};
use crate::messages::parse_socket_message;
use crate::monitor::{
    DispatchGate, HandlerRegistry, MonitorCapability, MonitorError, ProgressHandler,
    ProgressMonitor, Subscription,
};
use crate::reconnect::{Backoff, ReconnectPolicy};

/// Time allowed for the throwaway probe connection to open.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-job bookkeeping used to force a single terminal event.
#[derive(Debug, Default)]
struct JobState {
    job_id: Option<String>,
    active: bool,
    completed_emitted: bool,
    last_status: String,
    last_total: u32,
}

/// Handle to a running session task.
struct Session {
    cancel: CancellationToken,
    /// True while the socket is open.
    connected: Arc<AtomicBool>,
    /// True until the task exits (cancelled or gave up).
    alive: Arc<AtomicBool>,
}

/// Shared with the session task.
struct Shared {
    client: SocketClient,
    policy: ReconnectPolicy,
    registry: Arc<HandlerRegistry>,
    gate: DispatchGate,
    job: Mutex<JobState>,
}

/// Progress monitor backed by the `ws(s)://{host}/ws` endpoint.
pub struct SocketProgressMonitor {
    shared: Arc<Shared>,
    probe_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl SocketProgressMonitor {
    pub fn new(client: SocketClient, policy: ReconnectPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                policy,
                registry: HandlerRegistry::new(),
                gate: DispatchGate::new(()),
                job: Mutex::new(JobState::default()),
            }),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            session: Mutex::new(None),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        self.shared.client.url()
    }

    /// Start tracking a job so that [`finish_job`](Self::finish_job) can
    /// force its terminal event.
    pub fn begin_job(&self, job_id: Option<&str>) {
        let mut job = self.shared.job.lock();
        *job = JobState {
            job_id: job_id.map(str::to_owned),
            active: true,
            ..JobState::default()
        };
    }

    /// Stop tracking the current job. With `force_complete`, dispatch a
    /// synthesized `completed` event unless the server already sent one.
    pub fn finish_job(&self, force_complete: bool) {
        let _gate = self.shared.gate.lock();
        let event = {
            let mut job = self.shared.job.lock();
            let event = if force_complete && job.active && !job.completed_emitted {
                tracing::debug!(job_id = ?job.job_id, "Progress socket force-completed");
                job.completed_emitted = true;
                Some(ProgressEvent::completed(job.last_status.clone(), job.last_total))
            } else {
                None
            };
            job.active = false;
            event
        };
        if let Some(event) = event {
            self.shared.registry.dispatch(&event);
        }
    }

    /// Whether a session task is running (connected or reconnecting).
    fn session_alive(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.alive.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ProgressMonitor for SocketProgressMonitor {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn probe(&self) -> MonitorCapability {
        match tokio::time::timeout(self.probe_timeout, self.shared.client.connect()).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.close(None).await;
                MonitorCapability::SUPPORTED
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Progress socket probe failed");
                MonitorCapability::UNSUPPORTED
            }
            Err(_) => {
                tracing::debug!(url = %self.url(), "Progress socket probe timed out");
                MonitorCapability::UNSUPPORTED
            }
        }
    }

    async fn connect(&self) -> Result<(), MonitorError> {
        if self.session_alive() {
            return Ok(());
        }

        let stream = self.shared.client.connect().await?;
        tracing::info!(url = %self.url(), "Connected to progress socket");

        let session = Session {
            cancel: CancellationToken::new(),
            connected: Arc::new(AtomicBool::new(true)),
            alive: Arc::new(AtomicBool::new(true)),
        };

        let shared = Arc::clone(&self.shared);
        let cancel = session.cancel.clone();
        let connected = Arc::clone(&session.connected);
        let alive = Arc::clone(&session.alive);

        let previous = self.session.lock().replace(session);
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        tokio::spawn(async move {
            run_session(&shared, stream, &connected, &cancel).await;
            connected.store(false, Ordering::SeqCst);
            alive.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    fn disconnect(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
            session.connected.store(false, Ordering::SeqCst);
            tracing::debug!(url = %self.url(), "Progress socket disconnected");
        }
        // Frames are dispatched under the gate after a cancellation check,
        // so holding it here fences out any in-flight dispatch.
        let _gate = self.shared.gate.lock();
        *self.shared.job.lock() = JobState::default();
        self.shared.registry.clear();
    }

    fn subscribe(&self, handler: ProgressHandler) -> Subscription {
        self.shared.registry.subscribe(handler)
    }

    fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::SeqCst))
    }
}

/// Session loop: read frames -> on drop, back off and reconnect.
///
/// Runs until cancelled or until the reconnect policy gives up.
async fn run_session(
    shared: &Shared,
    mut stream: WsStream,
    connected: &AtomicBool,
    cancel: &CancellationToken,
) {
    let mut backoff = Backoff::default();

    loop {
        connected.store(true, Ordering::SeqCst);
        backoff.reset();

        read_frames(shared, &mut stream, cancel).await;
        connected.store(false, Ordering::SeqCst);

        if cancel.is_cancelled() {
            let _ = stream.close(None).await;
            return;
        }

        tracing::warn!(url = %shared.client.url(), "Progress socket closed unexpectedly");

        stream = loop {
            let Some(delay) = backoff.on_failure(&shared.policy) else {
                tracing::warn!(
                    url = %shared.client.url(),
                    failures = backoff.failures(),
                    "Giving up on progress socket",
                );
                return;
            };

            tracing::info!(
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to progress socket",
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = shared.client.connect() => result,
            };

            match result {
                Ok(stream) => {
                    tracing::info!(attempt = backoff.failures(), "Reconnected to progress socket");
                    break stream;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt {} failed", backoff.failures());
                }
            }
        };
    }
}

/// Read frames until the socket closes, errors, or `cancel` fires.
async fn read_frames(shared: &Shared, stream: &mut WsStream, cancel: &CancellationToken) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => handle_text_frame(shared, &text, cancel),
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary frame on progress socket");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Handled automatically by tungstenite.
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "Progress socket closed by server");
                return;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Progress socket receive error");
                return;
            }
            None => return,
        }
    }
}

fn handle_text_frame(shared: &Shared, text: &str, cancel: &CancellationToken) {
    let event = match parse_socket_message(text) {
        Ok(msg) => msg.into_event(),
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to parse progress frame");
            return;
        }
    };

    let _gate = shared.gate.lock();
    {
        let mut job = shared.job.lock();
        if cancel.is_cancelled() {
            return;
        }
        if job.active {
            if event.is_completed() {
                job.completed_emitted = true;
            }
            job.last_status.clone_from(&event.status);
            if event.total > 0 {
                job.last_total = event.total;
            }
        }
    }
    shared.registry.dispatch(&event);
}
