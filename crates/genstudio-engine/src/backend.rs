use genstudio_contracts::jobs::{JobHandle, JobStatus};
use genstudio_contracts::media::ImagePayload;
use reqwest::blocking::{Client as HttpClient, RequestBuilder as HttpRequest, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde_json::{json, Map, Value};

use crate::config::StudioConfig;
use crate::error::{StudioError, StudioResult};
use crate::request::ContentPart;
use crate::truncate_text;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

impl GenerationOptions {
    pub fn standard() -> Self {
        Self {
            temperature: 0.4,
            top_k: 32,
            top_p: 1.0,
            max_output_tokens: 8192,
        }
    }

    /// Low-temperature settings used by the simplified edit path.
    pub fn conservative() -> Self {
        Self {
            temperature: 0.1,
            top_k: 16,
            top_p: 0.8,
            max_output_tokens: 4096,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "temperature": self.temperature,
            "topK": self.top_k,
            "topP": self.top_p,
            "maxOutputTokens": self.max_output_tokens,
        })
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub prompt: String,
    pub model: String,
    pub negative_prompt: Option<String>,
    pub aspect_ratio: Option<String>,
    pub image: Option<ImagePayload>,
}

impl VideoRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            negative_prompt: None,
            aspect_ratio: None,
            image: None,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut instance = Map::new();
        instance.insert("prompt".to_string(), Value::String(self.prompt.clone()));
        if let Some(image) = &self.image {
            instance.insert(
                "image".to_string(),
                json!({
                    "bytesBase64Encoded": image.to_base64(),
                    "mimeType": image.mime_type,
                }),
            );
        }
        let mut parameters = Map::new();
        if let Some(ratio) = self.aspect_ratio.as_deref().filter(|value| !value.is_empty()) {
            parameters.insert("aspectRatio".to_string(), Value::String(ratio.to_string()));
        }
        if let Some(negative) = self
            .negative_prompt
            .as_deref()
            .filter(|value| !value.is_empty())
        {
            parameters.insert(
                "negativePrompt".to_string(),
                Value::String(negative.to_string()),
            );
        }
        json!({
            "instances": [Value::Object(instance)],
            "parameters": Value::Object(parameters),
        })
    }
}

/// Bytes fetched from a job result reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAsset {
    pub uri: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Image endpoints of the provider. Implementations return the raw JSON
/// document; interpretation belongs to the orchestrator.
pub trait ImageBackend: Send + Sync {
    fn generate_content(
        &self,
        model: &str,
        parts: &[ContentPart],
        options: &GenerationOptions,
    ) -> StudioResult<Value>;

    fn predict_image(&self, model: &str, prompt: &str) -> StudioResult<Value>;
}

/// Long-running video job endpoints.
pub trait VideoBackend: Send + Sync {
    fn start_video(&self, request: &VideoRequest) -> StudioResult<JobHandle>;
    fn job_status(&self, handle: &JobHandle) -> StudioResult<JobStatus>;
    fn download_asset(&self, uri: &str) -> StudioResult<DownloadedAsset>;
}

pub struct GeminiHttpBackend {
    api_base: String,
    api_origin: Url,
    api_key: String,
    http: HttpClient,
}

impl GeminiHttpBackend {
    pub fn new(config: &StudioConfig) -> StudioResult<Self> {
        let Some(api_key) = config.api_key.clone() else {
            return Err(StudioError::Config(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            ));
        };
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| StudioError::Config(format!("failed building HTTP client: {err}")))?;
        let api_base = config.api_base.trim().trim_end_matches('/').to_string();
        let api_origin = Url::parse(&api_base)
            .map_err(|err| StudioError::Config(format!("invalid API base {api_base:?}: {err}")))?;
        Ok(Self {
            api_base,
            api_origin,
            api_key,
            http,
        })
    }

    fn endpoint_for_model(&self, model: &str, method: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:{}", self.api_base, model_path, method)
    }

    fn operation_url(&self, handle: &JobHandle) -> String {
        let name = handle.as_str().trim();
        if name.starts_with("http://") || name.starts_with("https://") {
            return name.to_string();
        }
        format!("{}/{}", self.api_base, name.trim_start_matches('/'))
    }

    /// The API key is only ever attached to requests aimed at the API base
    /// origin. Anything else is refused before a connection is made.
    fn send(&self, request: HttpRequest, label: &str) -> StudioResult<HttpResponse> {
        let mut request = request
            .build()
            .map_err(|err| StudioError::Validation(format!("{label} URL is invalid: {err}")))?;
        if request.url().origin() != self.api_origin.origin() {
            return Err(StudioError::Validation(format!(
                "{label} URL must point at the provider API host"
            )));
        }
        request
            .url_mut()
            .query_pairs_mut()
            .append_pair("key", &self.api_key);
        let response = self
            .http
            .execute(request)
            .map_err(|err| StudioError::Network(format!("{label} request failed: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(StudioError::from_status(
            status.as_u16(),
            provider_error_message(&body),
        ))
    }

    fn send_json(&self, request: HttpRequest, label: &str) -> StudioResult<Value> {
        let response = self.send(request, label)?;
        let body = response
            .text()
            .map_err(|err| StudioError::Network(format!("{label} response body read failed: {err}")))?;
        serde_json::from_str(&body)
            .map_err(|_| StudioError::EmptyResult(format!("{label} returned invalid JSON payload")))
    }
}

impl ImageBackend for GeminiHttpBackend {
    fn generate_content(
        &self,
        model: &str,
        parts: &[ContentPart],
        options: &GenerationOptions,
    ) -> StudioResult<Value> {
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts.iter().map(ContentPart::to_json).collect::<Vec<Value>>(),
            }],
            "generationConfig": options.to_json(),
        });
        let endpoint = self.endpoint_for_model(model, "generateContent");
        self.send_json(self.http.post(&endpoint).json(&payload), "Gemini")
    }

    fn predict_image(&self, model: &str, prompt: &str) -> StudioResult<Value> {
        let payload = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": { "sampleCount": 1 },
        });
        let endpoint = self.endpoint_for_model(model, "predict");
        self.send_json(self.http.post(&endpoint).json(&payload), "Imagen")
    }
}

impl VideoBackend for GeminiHttpBackend {
    fn start_video(&self, request: &VideoRequest) -> StudioResult<JobHandle> {
        let endpoint = self.endpoint_for_model(&request.model, "predictLongRunning");
        let response = self.send_json(
            self.http.post(&endpoint).json(&request.to_json()),
            "Veo",
        )?;
        response
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(JobHandle::new)
            .ok_or_else(|| StudioError::EmptyResult("Veo response missing operation name".to_string()))
    }

    fn job_status(&self, handle: &JobHandle) -> StudioResult<JobStatus> {
        let url = self.operation_url(handle);
        let payload = self.send_json(self.http.get(&url), "Veo operation")?;
        Ok(JobStatus::from_operation(&payload))
    }

    fn download_asset(&self, uri: &str) -> StudioResult<DownloadedAsset> {
        let response = self.send(self.http.get(uri), "asset download")?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| StudioError::Network(format!("failed reading asset bytes: {err}")))?
            .to_vec();
        Ok(DownloadedAsset {
            uri: uri.to_string(),
            bytes,
            content_type,
        })
    }
}

/// Prefers `error.message` from a provider error document, else the raw
/// body, truncated.
pub fn provider_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.get("error"))
        .and_then(|error| {
            error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());
    truncate_text(&message, 512)
}
