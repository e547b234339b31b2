//! Contract for the external vision-language model (Flash and Pro tiers).
//!
//! `ModelClient` is deliberately thin: it owns media upload/activation and a
//! single `generate` call, and says nothing about the wire format the
//! concrete backend uses underneath. A real implementation (for example one
//! backed by Gemini) lives in a separate crate; this crate only ships a
//! deterministic in-memory double used by tests and by the executor's
//! fallback path.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::EventType;

/// Which validator tier a call is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// The cheap, broad first-pass validator.
    Flash,
    /// The costlier, narrower second-pass validator.
    Pro,
}

/// The time window a model call is scoped to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelWindow {
    /// Window start, in seconds.
    pub start_s: f64,
    /// Window end, in seconds.
    pub end_s: f64,
}

/// Opaque handle to an uploaded media file, returned by `upload_media` and
/// passed back into every `generate` call for the run.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    /// Backend-assigned identifier for the uploaded file.
    pub uri: String,
}

/// Errors a `ModelClient` implementation can surface. All are treated as
/// per-call failures by the executor: an upload failure puts the whole
/// cascade into fallback mode, while a `generate` failure is retried and
/// then falls back for that packet alone.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The call exceeded its per-attempt deadline.
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    /// Upload never reached the ACTIVE state within the poll budget.
    #[error("media did not become active after {0} polls")]
    UploadNotActive(u32),
    /// A transient failure (network, 5xx-equivalent) that is safe to retry.
    #[error("transient model error: {0}")]
    Transient(String),
    /// The response body did not parse as JSON at all.
    #[error("response was not valid JSON: {0}")]
    InvalidJson(String),
}

/// Request payload for a single tier invocation.
pub struct GenerateRequest<'a> {
    /// The packet this request is validating. Pinned into the prompt so the
    /// response can be checked for identity mismatch.
    pub packet_id: &'a str,
    /// The candidate id, also pinned into the prompt.
    pub candidate_id: &'a str,
    /// The violation type under review.
    pub event_type: EventType,
    /// The time window to inspect.
    pub window: ModelWindow,
    /// Sampling rate the model should use when reviewing the window.
    pub fps: u32,
}

/// Contract for the external model backend. Implementations are expected to
/// be cheap to clone (e.g. an `Arc`-wrapped HTTP client) since the executor
/// shares one instance across every worker in both tiers.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Uploads the run's source video once, before the Flash tier begins.
    async fn upload_media(&self, video_path: &Path) -> Result<MediaHandle, ModelError>;

    /// Polls the upload until it is usable for generation, or fails after a
    /// bounded number of attempts. The default implementation polls at 1s
    /// intervals for up to 30 attempts, matching the documented contract.
    async fn poll_until_active(&self, handle: &MediaHandle) -> Result<(), ModelError> {
        const MAX_POLLS: u32 = 30;
        const POLL_INTERVAL: Duration = Duration::from_secs(1);
        for _ in 0..MAX_POLLS {
            if self.is_active(handle).await? {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(ModelError::UploadNotActive(MAX_POLLS))
    }

    /// Returns whether the uploaded media is ready for generation calls.
    async fn is_active(&self, handle: &MediaHandle) -> Result<bool, ModelError>;

    /// Invokes the model for one packet and returns its raw JSON response.
    /// Callers validate the response against [`crate::flash::FlashEvent`] or
    /// [`crate::pro::ProResponse`] as appropriate for the tier.
    async fn generate(
        &self,
        tier: ModelTier,
        media: &MediaHandle,
        request: GenerateRequest<'_>,
    ) -> Result<serde_json::Value, ModelError>;
}

/// A `ModelClient` that always fails uploads, forcing the cascade into
/// fallback mode. Useful for exercising the no-API path deterministically.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableModelClient;

#[async_trait]
impl ModelClient for UnavailableModelClient {
    async fn upload_media(&self, _video_path: &Path) -> Result<MediaHandle, ModelError> {
        Err(ModelError::Transient("model backend unavailable".into()))
    }

    async fn is_active(&self, _handle: &MediaHandle) -> Result<bool, ModelError> {
        Ok(false)
    }

    async fn generate(
        &self,
        _tier: ModelTier,
        _media: &MediaHandle,
        _request: GenerateRequest<'_>,
    ) -> Result<serde_json::Value, ModelError> {
        Err(ModelError::Transient("model backend unavailable".into()))
    }
}
