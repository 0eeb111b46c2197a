//! Blocking client for a running `genstudio serve` instance.

use genstudio_contracts::api::{
    DownloadBody, ErrorBody, ImageBody, OperationBody, PromptBody, ROUTE_GEMINI_EDIT,
    ROUTE_GEMINI_EDIT_SIMPLE, ROUTE_GEMINI_GENERATE, ROUTE_IMAGEN_GENERATE, ROUTE_VEO_DOWNLOAD,
    ROUTE_VEO_GENERATE, ROUTE_VEO_OPERATION,
};
use genstudio_contracts::jobs::{JobHandle, JobStatus};
use genstudio_contracts::media::ImagePayload;
use genstudio_contracts::models::is_imagen_model;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backend::{DownloadedAsset, VideoBackend, VideoRequest};
use crate::config::StudioConfig;
use crate::error::{StudioError, StudioResult};
use crate::request::{
    MultipartPayload, RequestBuilder, FIELD_ASPECT_RATIO, FIELD_IMAGE_FILE, FIELD_MODEL,
    FIELD_NEGATIVE_PROMPT, FIELD_PROMPT,
};
use crate::truncate_text;

const VIDEO_SOURCE_FILE_NAME: &str = "source-image";

pub struct RemoteStudioClient {
    base_url: String,
    http: HttpClient,
    simple_fallback: bool,
}

impl RemoteStudioClient {
    pub fn new(base_url: &str, config: &StudioConfig) -> StudioResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(StudioError::Config("studio server URL is empty".to_string()));
        }
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| StudioError::Config(format!("failed building HTTP client: {err}")))?;
        Ok(Self {
            base_url,
            http,
            simple_fallback: config.simple_fallback,
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    pub fn generate(&self, prompt: &str, model: Option<&str>) -> StudioResult<ImagePayload> {
        let route = if model.is_some_and(is_imagen_model) {
            ROUTE_IMAGEN_GENERATE
        } else {
            ROUTE_GEMINI_GENERATE
        };
        let body = PromptBody {
            prompt: prompt.to_string(),
            model: model.map(str::to_string),
        };
        let response = self.send(self.http.post(self.url(route)).json(&body))?;
        image_from_body(read_json(response)?)
    }

    /// Posts to the edit route and, when the server answers 500, repeats the
    /// same body once against the simplified edit route.
    pub fn edit(&self, builder: &RequestBuilder) -> StudioResult<ImagePayload> {
        let payload = builder.build_multipart();
        match self.post_multipart(ROUTE_GEMINI_EDIT, payload.clone()) {
            Err(StudioError::Service(_)) | Err(StudioError::ServiceDegraded { .. })
                if self.simple_fallback =>
            {
                self.post_multipart(ROUTE_GEMINI_EDIT_SIMPLE, payload)
            }
            other => other,
        }
    }

    pub fn edit_simple(&self, builder: &RequestBuilder) -> StudioResult<ImagePayload> {
        self.post_multipart(ROUTE_GEMINI_EDIT_SIMPLE, builder.build_multipart())
    }

    fn post_multipart(&self, route: &str, payload: MultipartPayload) -> StudioResult<ImagePayload> {
        let form = payload.into_form()?;
        let response = self.send(self.http.post(self.url(route)).multipart(form))?;
        image_from_body(read_json(response)?)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> StudioResult<HttpResponse> {
        let response = request
            .send()
            .map_err(|err| StudioError::Network(format!("studio request failed: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|parsed| parsed.error)
            .unwrap_or_else(|_| truncate_text(body.trim(), 512));
        Err(StudioError::from_status(status.as_u16(), message))
    }
}

impl VideoBackend for RemoteStudioClient {
    fn start_video(&self, request: &VideoRequest) -> StudioResult<JobHandle> {
        let mut payload = MultipartPayload::new();
        payload.push_text(FIELD_PROMPT, request.prompt.clone());
        payload.push_text(FIELD_MODEL, request.model.clone());
        if let Some(negative) = &request.negative_prompt {
            payload.push_text(FIELD_NEGATIVE_PROMPT, negative.clone());
        }
        if let Some(ratio) = &request.aspect_ratio {
            payload.push_text(FIELD_ASPECT_RATIO, ratio.clone());
        }
        if let Some(image) = &request.image {
            payload.push_file(
                FIELD_IMAGE_FILE,
                VIDEO_SOURCE_FILE_NAME,
                image.mime_type.clone(),
                image.bytes.clone(),
            );
        }
        let response = self.send(
            self.http
                .post(self.url(ROUTE_VEO_GENERATE))
                .multipart(payload.into_form()?),
        )?;
        let body: OperationBody = read_json(response)?;
        Ok(JobHandle::new(body.name))
    }

    fn job_status(&self, handle: &JobHandle) -> StudioResult<JobStatus> {
        let body = OperationBody {
            name: handle.as_str().to_string(),
        };
        let response = self.send(self.http.post(self.url(ROUTE_VEO_OPERATION)).json(&body))?;
        read_json(response)
    }

    fn download_asset(&self, uri: &str) -> StudioResult<DownloadedAsset> {
        let body = DownloadBody {
            uri: uri.to_string(),
        };
        let response = self.send(self.http.post(self.url(ROUTE_VEO_DOWNLOAD)).json(&body))?;
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

fn read_json<T: DeserializeOwned>(response: HttpResponse) -> StudioResult<T> {
    let text = response
        .text()
        .map_err(|err| StudioError::Network(format!("studio response body read failed: {err}")))?;
    serde_json::from_str(&text).map_err(|err| {
        StudioError::EmptyResult(format!("studio returned unexpected payload: {err}"))
    })
}

fn image_from_body(body: Value) -> StudioResult<ImagePayload> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Err(StudioError::EmptyResult(error.to_string()));
    }
    let parsed: ImageBody = serde_json::from_value(body)
        .map_err(|_| StudioError::EmptyResult("No image generated".to_string()))?;
    parsed.to_payload().map_err(StudioError::EmptyResult)
}
