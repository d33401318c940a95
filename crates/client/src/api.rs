//! REST API client for the generation server's HTTP endpoints.
//!
//! Wraps generation submission (`txt2img` / `img2img`) and the progress
//! snapshot endpoint using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use canvasgen_core::generation::{GenerationApi, GenerationError, GenerationOutput};
use canvasgen_core::job::JobKind;
use canvasgen_core::types::Params;

use crate::messages::ProgressSnapshot;

/// HTTP client for a single generation server.
pub struct SdApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Generation API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl From<ApiError> for GenerationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Request(e) if e.is_decode() => Self::InvalidResponse(e.to_string()),
            ApiError::Request(e) => Self::Transport(e.to_string()),
            ApiError::ApiError { status, body } => Self::Rejected { status, body },
        }
    }
}

impl SdApi {
    /// Create a new API client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:7860/sdapi/v1`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (shares the connection pool between submission and polling).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build a client whose requests time out after `timeout`.
    pub fn with_timeout(api_url: String, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Base HTTP URL without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Endpoint path for a job kind. Inpainting is an `img2img` call with
    /// a mask in its parameters.
    pub fn endpoint_for(kind: JobKind) -> &'static str {
        match kind {
            JobKind::TextToImage => "txt2img",
            JobKind::ImageToImage | JobKind::Inpaint => "img2img",
        }
    }

    /// Submit a generation request.
    ///
    /// Sends `POST {base}/txt2img` or `POST {base}/img2img` with the
    /// parameters as the JSON body and waits for the images.
    pub async fn generate(
        &self,
        kind: JobKind,
        params: &Params,
    ) -> Result<GenerationOutput, ApiError> {
        let response = self
            .client
            .post(format!("{}/{}", self.api_url, Self::endpoint_for(kind)))
            .json(params)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the current progress snapshot.
    ///
    /// Sends `GET {base}/progress`, scoped to `job_id` when given.
    pub async fn fetch_progress(&self, job_id: Option<&str>) -> Result<ProgressSnapshot, ApiError> {
        let mut request = self.client.get(format!("{}/progress", self.api_url));
        if let Some(id) = job_id {
            request = request.query(&[("job_id", id)]);
        }

        let response = request.send().await?;
        Self::parse_response(response).await
    }

    /// Like [`fetch_progress`](Self::fetch_progress) but bounded by
    /// `timeout`, used for capability probes.
    pub async fn fetch_progress_within(
        &self,
        timeout: Duration,
    ) -> Result<ProgressSnapshot, ApiError> {
        let response = self
            .client
            .get(format!("{}/progress", self.api_url))
            .timeout(timeout)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl GenerationApi for SdApi {
    async fn submit(
        &self,
        kind: JobKind,
        params: &Params,
    ) -> Result<GenerationOutput, GenerationError> {
        let output = self.generate(kind, params).await?;
        tracing::debug!(
            kind = %kind,
            images = output.images.len(),
            "Generation request returned",
        );
        Ok(output)
    }
}
