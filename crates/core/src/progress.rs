//! Progress events produced by progress monitors.
//!
//! Events are transient: they live only for the duration of one job's
//! execution and are never persisted.

use serde::{Deserialize, Serialize};

/// Inferred stage of a running generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Waiting,
    Sampling,
    VaeDecode,
    Postprocessing,
    Completed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Sampling => "sampling",
            Self::VaeDecode => "vae-decode",
            Self::Postprocessing => "postprocessing",
            Self::Completed => "completed",
        }
    }

    /// Classify a server job name by substring.
    ///
    /// Returns `None` when the name carries no phase information; callers
    /// decide the fallback (step counts, previous phase).
    pub fn from_job_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("vae") || name.contains("decode") {
            Some(Self::VaeDecode)
        } else if name.contains("postprocess") {
            Some(Self::Postprocessing)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of generation progress delivered to subscribed handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Current step.
    pub current: u32,
    /// Total steps, `0` when unknown.
    pub total: u32,
    pub phase: Phase,
    /// Free-text job name reported by the server.
    pub status: String,
    /// Base64 preview image, when the server provides one.
    pub preview_image: Option<String>,
    pub eta_seconds: Option<f64>,
    pub job_index: Option<u32>,
    pub job_count: Option<u32>,
}

impl ProgressEvent {
    /// The terminal event for a run, carrying the last known step counts.
    pub fn completed(status: impl Into<String>, total: u32) -> Self {
        Self {
            current: total,
            total,
            phase: Phase::Completed,
            status: status.into(),
            preview_image: None,
            eta_seconds: Some(0.0),
            job_index: None,
            job_count: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }

    /// Completion percentage (0-100) derived from step counts.
    pub fn percent(&self) -> u8 {
        if self.is_completed() {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        let pct = (f64::from(self.current) / f64::from(self.total)) * 100.0;
        pct.clamp(0.0, 100.0) as u8
    }
}
