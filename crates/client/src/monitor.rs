//! The progress monitor contract shared by every transport.
//!
//! A monitor observes a generation server and pushes [`ProgressEvent`]s to
//! subscribed handlers. Handlers live in a [`HandlerRegistry`] owned by the
//! monitor; a [`Subscription`] only holds a weak reference back to it, so
//! dropping the monitor never keeps handlers alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use canvasgen_core::progress::ProgressEvent;
use parking_lot::{Mutex, ReentrantMutex};

use crate::client::SocketClientError;

/// Callback invoked for each progress event.
///
/// Handlers run on the monitor's task. They may stop or finish the job on
/// the monitor that is dispatching to them.
pub type ProgressHandler = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Held across event delivery and by every stop path, so that once a stop
/// returns no earlier event is still being delivered on another thread.
/// Reentrant so a handler can stop the monitor it runs on.
pub(crate) type DispatchGate = ReentrantMutex<()>;

/// Outcome of a transport feature probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorCapability {
    pub supported: bool,
}

impl MonitorCapability {
    pub const SUPPORTED: Self = Self { supported: true };
    pub const UNSUPPORTED: Self = Self { supported: false };
}

/// Errors surfaced by monitor operations.
///
/// None of these abort a job; they only degrade progress feedback.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The transport is not available on this server.
    #[error("Progress transport unsupported: {0}")]
    Unsupported(String),

    /// The transport dropped and could not be re-established.
    #[error("Progress transport disconnected: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Socket(#[from] SocketClientError),
}

/// Interface implemented by every progress transport.
#[async_trait]
pub trait ProgressMonitor: Send + Sync {
    /// Short transport name used in logs, e.g. `"socket"`.
    fn name(&self) -> &'static str;

    /// Check whether the server supports this transport. Never fails:
    /// any transport error resolves to [`MonitorCapability::UNSUPPORTED`].
    async fn probe(&self) -> MonitorCapability;

    /// Start observing. A no-op when already connected.
    async fn connect(&self) -> Result<(), MonitorError>;

    /// Stop observing, cancel timers and tasks, and drop every handler.
    ///
    /// Safe to call repeatedly; a later [`connect`](Self::connect) starts
    /// a fresh session.
    fn disconnect(&self);

    fn subscribe(&self, handler: ProgressHandler) -> Subscription;

    fn is_connected(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Id-keyed set of progress handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<u64, ProgressHandler>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler. The returned token removes it again.
    pub fn subscribe(self: &Arc<Self>, handler: ProgressHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, handler);
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver `event` to every registered handler.
    ///
    /// The handler set is snapshotted first so handlers may subscribe or
    /// unsubscribe while being called.
    pub fn dispatch(&self, event: &ProgressEvent) {
        let handlers: Vec<ProgressHandler> = self.handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }
}

/// Token returned by `subscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    /// Remove the handler. Returns `false` if it was already gone (the
    /// registry was cleared or dropped).
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.remove(self.id))
            .unwrap_or(false)
    }
}
