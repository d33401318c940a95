//! Transport selection and lifecycle for progress monitoring.
//!
//! [`ProgressService`] owns one monitor per transport and keeps at most one
//! of them connected. Callers subscribe to the service rather than to a
//! monitor, so their handlers survive a transport switch: whenever a
//! monitor is connected the service installs a forwarding handler on it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use canvasgen_core::progress::ProgressEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::monitor::{
    HandlerRegistry, MonitorCapability, ProgressHandler, ProgressMonitor, Subscription,
};
use crate::polling::PollingProgressMonitor;
use crate::socket::SocketProgressMonitor;

// ---------------------------------------------------------------------------
// Transport mode
// ---------------------------------------------------------------------------

/// User-selected progress transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Probe socket, then polling, else none.
    #[default]
    Auto,
    Socket,
    Polling,
    None,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Socket => "socket",
            Self::Polling => "polling",
            Self::None => "none",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "socket" => Ok(Self::Socket),
            "polling" => Ok(Self::Polling),
            "none" => Ok(Self::None),
            other => Err(format!("Unknown progress transport: {other}")),
        }
    }
}

/// The monitor currently in use.
#[derive(Clone, Default)]
pub enum ActiveTransport {
    Socket(Arc<SocketProgressMonitor>),
    Polling(Arc<PollingProgressMonitor>),
    #[default]
    None,
}

impl ActiveTransport {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Socket(_) => "socket",
            Self::Polling(_) => "polling",
            Self::None => "none",
        }
    }

    fn monitor(&self) -> Option<&dyn ProgressMonitor> {
        match self {
            Self::Socket(m) => Some(m.as_ref()),
            Self::Polling(m) => Some(m.as_ref()),
            Self::None => None,
        }
    }
}

impl fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Chooses, connects and drives the active progress monitor.
pub struct ProgressService {
    socket: Arc<SocketProgressMonitor>,
    polling: Arc<PollingProgressMonitor>,
    /// Handlers registered by callers; fed by the active monitor.
    registry: Arc<HandlerRegistry>,
    active: Mutex<ActiveTransport>,
    /// Probe results keyed by transport name, computed at most once.
    capabilities: Mutex<HashMap<&'static str, MonitorCapability>>,
    /// Serializes `configure` and `shutdown`.
    configure_lock: tokio::sync::Mutex<()>,
}

impl ProgressService {
    pub fn new(socket: SocketProgressMonitor, polling: PollingProgressMonitor) -> Self {
        Self {
            socket: Arc::new(socket),
            polling: Arc::new(polling),
            registry: HandlerRegistry::new(),
            active: Mutex::new(ActiveTransport::None),
            capabilities: Mutex::new(HashMap::new()),
            configure_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Select and connect a transport for `mode`.
    ///
    /// The previous monitor is disconnected before the new one connects.
    /// A connect failure leaves the service on `none`. Returns the name of
    /// the transport now active.
    pub async fn configure(&self, mode: TransportMode) -> &'static str {
        let _guard = self.configure_lock.lock().await;

        let target = match mode {
            TransportMode::Auto => self.auto_select().await,
            TransportMode::Socket => ActiveTransport::Socket(Arc::clone(&self.socket)),
            TransportMode::Polling => ActiveTransport::Polling(Arc::clone(&self.polling)),
            TransportMode::None => ActiveTransport::None,
        };

        self.deactivate();

        let Some(monitor) = target.monitor() else {
            tracing::info!(%mode, "Progress monitoring disabled");
            return ActiveTransport::None.name();
        };

        let registry = Arc::clone(&self.registry);
        let forward: ProgressHandler =
            Arc::new(move |event: &ProgressEvent| registry.dispatch(event));
        let _forwarding = monitor.subscribe(forward);

        if let Err(e) = monitor.connect().await {
            tracing::warn!(
                %mode,
                transport = monitor.name(),
                error = %e,
                "Progress transport failed to connect, continuing without progress",
            );
            monitor.disconnect();
            return ActiveTransport::None.name();
        }

        let name = target.name();
        *self.active.lock() = target;
        tracing::info!(%mode, transport = name, "Progress transport active");
        name
    }

    /// Prepare the active transport for a new job.
    pub fn start_for_job(&self, job_id: Option<&str>) {
        match self.active() {
            ActiveTransport::Socket(socket) => socket.begin_job(job_id),
            ActiveTransport::Polling(polling) => polling.start_polling(job_id),
            ActiveTransport::None => {}
        }
    }

    /// Finish the current job on the active transport.
    ///
    /// With `force_complete`, handlers receive exactly one `completed` event
    /// for the job before this returns (unless the transport already sent
    /// one).
    pub fn stop_polling(&self, force_complete: bool) {
        match self.active() {
            ActiveTransport::Socket(socket) => socket.finish_job(force_complete),
            ActiveTransport::Polling(polling) => polling.stop_polling(force_complete),
            ActiveTransport::None => {}
        }
    }

    /// Register a handler that receives events from whichever transport is
    /// active, now or after a later `configure`.
    pub fn subscribe(&self, handler: ProgressHandler) -> Subscription {
        self.registry.subscribe(handler)
    }

    pub fn active_transport_name(&self) -> &'static str {
        self.active.lock().name()
    }

    /// Cached probe result for a transport, if it has been probed.
    pub fn cached_capability(&self, transport: &str) -> Option<MonitorCapability> {
        self.capabilities.lock().get(transport).copied()
    }

    /// Disconnect the active monitor and drop every handler.
    pub async fn shutdown(&self) {
        let _guard = self.configure_lock.lock().await;
        self.deactivate();
        self.registry.clear();
        tracing::info!("Progress service shut down");
    }

    // ---- private helpers ----

    fn active(&self) -> ActiveTransport {
        self.active.lock().clone()
    }

    /// Swap the active slot to `none` and disconnect what was there.
    fn deactivate(&self) {
        let previous = std::mem::take(&mut *self.active.lock());
        if let Some(monitor) = previous.monitor() {
            monitor.disconnect();
            tracing::debug!(transport = monitor.name(), "Progress transport disconnected");
        }
    }

    async fn auto_select(&self) -> ActiveTransport {
        if self.capability(self.socket.as_ref()).await.supported {
            return ActiveTransport::Socket(Arc::clone(&self.socket));
        }
        if self.capability(self.polling.as_ref()).await.supported {
            return ActiveTransport::Polling(Arc::clone(&self.polling));
        }
        ActiveTransport::None
    }

    async fn capability(&self, monitor: &dyn ProgressMonitor) -> MonitorCapability {
        if let Some(cached) = self.cached_capability(monitor.name()) {
            return cached;
        }
        let capability = monitor.probe().await;
        tracing::debug!(
            transport = monitor.name(),
            supported = capability.supported,
            "Progress transport probed",
        );
        self.capabilities.lock().insert(monitor.name(), capability);
        capability
    }
}
