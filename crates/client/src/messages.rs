//! Wire types for the two progress transports.
//!
//! The socket endpoint pushes JSON frames shaped like
//! `{"current": 3, "total": 20, "status": "...", "preview": "...", "eta": 4.2}`.
//! Legacy servers do not send a phase, so it is derived client-side from
//! the status text.
//!
//! The polling endpoint returns a [`ProgressSnapshot`] whose fields may be
//! missing or zero; absence of a job is the only "idle" signal.

use canvasgen_core::progress::{Phase, ProgressEvent};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Socket frames
// ---------------------------------------------------------------------------

/// A progress frame pushed over the socket.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketProgressMessage {
    pub current: u32,
    pub total: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub eta: Option<f64>,
}

impl SocketProgressMessage {
    /// Convert into a [`ProgressEvent`], deriving the phase from the
    /// status text and step counts.
    pub fn into_event(self) -> ProgressEvent {
        let phase = derive_socket_phase(&self.status, self.current, self.total);
        ProgressEvent {
            current: self.current,
            total: self.total,
            phase,
            status: self.status,
            preview_image: self.preview,
            eta_seconds: self.eta,
            job_index: None,
            job_count: None,
        }
    }
}

fn derive_socket_phase(status: &str, current: u32, total: u32) -> Phase {
    let lower = status.to_ascii_lowercase();
    if ["completed", "complete", "done", "finished"]
        .iter()
        .any(|word| lower == *word)
    {
        return Phase::Completed;
    }
    if let Some(phase) = Phase::from_job_name(status) {
        return phase;
    }
    if total > 0 && current > 0 {
        Phase::Sampling
    } else {
        Phase::Waiting
    }
}

/// Parse a socket text frame.
///
/// Returns `Err` for malformed JSON or missing step counts. Callers
/// should log and discard.
pub fn parse_socket_message(text: &str) -> Result<SocketProgressMessage, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Polling snapshots
// ---------------------------------------------------------------------------

/// Server-side job state inside a [`ProgressSnapshot`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotState {
    /// Current job name, empty when idle.
    #[serde(deserialize_with = "null_as_default")]
    pub job: String,
    pub job_count: i64,
    pub job_no: i64,
    pub sampling_step: i64,
    pub sampling_steps: i64,
}

/// Response of `GET {base}/progress`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProgressSnapshot {
    pub state: SnapshotState,
    /// Fractional progress in `[0, 1]`.
    pub progress: f64,
    pub current_image: Option<String>,
    pub eta_relative: Option<f64>,
}

impl ProgressSnapshot {
    /// Whether the server reports any running work.
    pub fn is_active(&self) -> bool {
        self.state.job_count > 0 || !self.state.job.is_empty() || self.progress > 0.0
    }

    pub fn step(&self) -> u32 {
        clamp_u32(self.state.sampling_step)
    }

    pub fn total_steps(&self) -> u32 {
        clamp_u32(self.state.sampling_steps)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
