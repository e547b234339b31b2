//! A `ModelClient` backed by a Gemini-style Files API + `generateContent`
//! endpoint.

use std::path::Path;

use async_trait::async_trait;
use cascade_core::model_client::{GenerateRequest, MediaHandle, ModelClient, ModelError, ModelTier};
use reqwest::Client;
use serde::Deserialize;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_FLASH_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_PRO_MODEL: &str = "gemini-2.0-pro";

/// Gemini-backed model client used for both the Flash and Pro tiers.
///
/// Cheap to clone: the inner `reqwest::Client` is pooled internally, and
/// every field besides it is a small owned string.
#[derive(Clone)]
pub struct GeminiModelClient {
    api_key: Option<String>,
    flash_model: String,
    pro_model: String,
    api_base: String,
    client: Client,
}

// Custom Debug to prevent API key exposure in logs.
impl std::fmt::Debug for GeminiModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiModelClient")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("flash_model", &self.flash_model)
            .field("pro_model", &self.pro_model)
            .field("api_base", &self.api_base)
            .field("client", &"[reqwest::Client]")
            .finish()
    }
}

impl Default for GeminiModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiModelClient {
    /// Creates a client with no API key set; callers must supply one via
    /// [`Self::with_api_key`] before issuing requests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            api_key: None,
            flash_model: DEFAULT_FLASH_MODEL.to_string(),
            pro_model: DEFAULT_PRO_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            client: Client::new(),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_flash_model(mut self, model: impl Into<String>) -> Self {
        self.flash_model = model.into();
        self
    }

    #[must_use]
    pub fn with_pro_model(mut self, model: impl Into<String>) -> Self {
        self.pro_model = model.into();
        self
    }

    /// Overrides the API base URL; used by tests to point at a local mock
    /// server instead of the real Gemini endpoint.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Flash => &self.flash_model,
            ModelTier::Pro => &self.pro_model,
        }
    }

    fn api_key(&self) -> Result<&str, ModelError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ModelError::Transient("no API key configured".to_string()))
    }

    fn prompt_for(&self, request: &GenerateRequest<'_>) -> String {
        format!(
            "packet_id={}\ncandidate_id={}\nevent_type={:?}\nwindow=[{:.2},{:.2}]\nfps={}\n\
             Return strict JSON matching the schema for this tier, echoing packet_id exactly.",
            request.packet_id,
            request.candidate_id,
            request.event_type,
            request.window.start_s,
            request.window.end_s,
            request.fps,
        )
    }
}

#[async_trait]
impl ModelClient for GeminiModelClient {
    async fn upload_media(&self, video_path: &Path) -> Result<MediaHandle, ModelError> {
        let api_key = self.api_key()?;
        let bytes = tokio::fs::read(video_path)
            .await
            .map_err(|e| ModelError::Transient(format!("failed to read video file: {e}")))?;
        let file_name = video_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("video.mp4")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("video/mp4")
            .map_err(|e| ModelError::Transient(format!("invalid multipart mime: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .header("x-goog-api-key", api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("upload request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ModelError::Transient(format!(
                "upload failed with status {}",
                response.status()
            )));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidJson(format!("malformed upload response: {e}")))?;
        Ok(MediaHandle { uri: body.file.uri })
    }

    async fn is_active(&self, handle: &MediaHandle) -> Result<bool, ModelError> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .get(&handle.uri)
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("status poll failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ModelError::Transient(format!(
                "status poll failed with status {}",
                response.status()
            )));
        }

        let body: FileStatus = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidJson(format!("malformed status response: {e}")))?;
        Ok(body.state == "ACTIVE")
    }

    async fn generate(
        &self,
        tier: ModelTier,
        media: &MediaHandle,
        request: GenerateRequest<'_>,
    ) -> Result<serde_json::Value, ModelError> {
        let api_key = self.api_key()?;
        let model = self.model_for(tier);
        let prompt = self.prompt_for(&request);

        let payload = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "file_data": { "file_uri": media.uri, "mime_type": "video/mp4" } },
                    { "text": prompt },
                ],
            }],
            "generationConfig": { "responseMimeType": "application/json" },
        });

        let url = format!("{}/models/{model}:generateContent", self.api_base);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("generate request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ModelError::Transient(format!(
                "generate failed with status {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidJson(format!("malformed generate envelope: {e}")))?;

        let text = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| ModelError::InvalidJson("response had no text part".to_string()))?;

        serde_json::from_str(&text)
            .map_err(|e| ModelError::InvalidJson(format!("model text was not JSON: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct FileStatus {
    state: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Vec<GenerateCandidate>,
}

#[derive(Debug, Deserialize)]
struct GenerateCandidate {
    content: GenerateContent,
}

#[derive(Debug, Deserialize)]
struct GenerateContent {
    parts: Vec<GeneratePart>,
}

#[derive(Debug, Deserialize)]
struct GeneratePart {
    #[serde(default)]
    text: Option<String>,
}
