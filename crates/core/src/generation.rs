//! Contract for the external generation API.
//!
//! The queue only needs one awaitable call per job; the HTTP
//! implementation lives in `canvasgen-client`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::JobKind;
use crate::types::Params;

/// Images returned by a successful generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Base64-encoded images, in server order.
    #[serde(default)]
    pub images: Vec<String>,
}

/// Reasons a submission did not produce images.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The request never got a response (network, DNS, TLS, timeout).
    #[error("Generation request failed: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status.
    #[error("Generation API error ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The server answered 2xx but the body was not usable.
    #[error("Invalid generation response: {0}")]
    InvalidResponse(String),
}

/// A generation backend that turns parameters into images.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    async fn submit(&self, kind: JobKind, params: &Params)
        -> Result<GenerationOutput, GenerationError>;
}
