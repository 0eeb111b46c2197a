//! Scripted backends. They replay queued results in order and record every
//! call, so orchestration can be exercised without network access.

use std::collections::VecDeque;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use genstudio_contracts::jobs::{JobHandle, JobStatus};
use genstudio_contracts::media::ImagePayload;
use serde_json::{json, Value};

use crate::backend::{DownloadedAsset, GenerationOptions, ImageBackend, VideoBackend, VideoRequest};
use crate::error::{StudioError, StudioResult};
use crate::request::ContentPart;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// `generateContent` or `predict`.
    pub endpoint: &'static str,
    pub model: String,
    pub prompt: String,
    pub image_count: usize,
    pub first_image: Option<ImagePayload>,
    pub options: GenerationOptions,
}

#[derive(Default)]
pub struct ScriptedImageBackend {
    script: Mutex<VecDeque<StudioResult<Value>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedImageBackend {
    pub fn new(script: Vec<StudioResult<Value>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, result: StudioResult<Value>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    fn next(&self, call: RecordedCall) -> StudioResult<Value> {
        if let Ok(mut rows) = self.calls.lock() {
            rows.push(call);
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Err(StudioError::Network("script exhausted".to_string())))
    }
}

impl ImageBackend for ScriptedImageBackend {
    fn generate_content(
        &self,
        model: &str,
        parts: &[ContentPart],
        options: &GenerationOptions,
    ) -> StudioResult<Value> {
        let mut prompt = String::new();
        let mut images = Vec::new();
        for part in parts {
            match part {
                ContentPart::Text(text) => prompt.push_str(text),
                ContentPart::InlineImage(image) => images.push(image.clone()),
            }
        }
        self.next(RecordedCall {
            endpoint: "generateContent",
            model: model.to_string(),
            prompt,
            image_count: images.len(),
            first_image: images.into_iter().next(),
            options: *options,
        })
    }

    fn predict_image(&self, model: &str, prompt: &str) -> StudioResult<Value> {
        self.next(RecordedCall {
            endpoint: "predict",
            model: model.to_string(),
            prompt: prompt.to_string(),
            image_count: 0,
            first_image: None,
            options: GenerationOptions::standard(),
        })
    }
}

#[derive(Default)]
pub struct ScriptedVideoBackend {
    statuses: Mutex<VecDeque<StudioResult<JobStatus>>>,
    status_calls: Mutex<u32>,
    started: Mutex<Vec<VideoRequest>>,
    downloads: Mutex<Vec<String>>,
}

impl ScriptedVideoBackend {
    pub const HANDLE: &'static str = "models/veo-3.0-generate-001/operations/scripted";

    pub fn new(statuses: Vec<StudioResult<JobStatus>>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            ..Self::default()
        }
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.lock().map(|count| *count).unwrap_or(0)
    }

    pub fn started(&self) -> Vec<VideoRequest> {
        self.started
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

impl VideoBackend for ScriptedVideoBackend {
    fn start_video(&self, request: &VideoRequest) -> StudioResult<JobHandle> {
        if let Ok(mut rows) = self.started.lock() {
            rows.push(request.clone());
        }
        Ok(JobHandle::new(Self::HANDLE))
    }

    fn job_status(&self, _handle: &JobHandle) -> StudioResult<JobStatus> {
        if let Ok(mut count) = self.status_calls.lock() {
            *count += 1;
        }
        self.statuses
            .lock()
            .ok()
            .and_then(|mut rows| rows.pop_front())
            .unwrap_or_else(|| Ok(JobStatus::pending()))
    }

    fn download_asset(&self, uri: &str) -> StudioResult<DownloadedAsset> {
        if let Ok(mut rows) = self.downloads.lock() {
            rows.push(uri.to_string());
        }
        Ok(DownloadedAsset {
            uri: uri.to_string(),
            bytes: b"\x00\x00\x00\x18ftypmp42".to_vec(),
            content_type: Some("video/mp4".to_string()),
        })
    }
}

/// A `generateContent` response carrying one inline image.
pub fn image_response(bytes: &[u8], mime_type: &str) -> Value {
    json!({
        "candidates": [{
            "content": {
                "parts": [
                    {"text": "Here is your image."},
                    {"inlineData": {"mimeType": mime_type, "data": BASE64.encode(bytes)}}
                ]
            }
        }]
    })
}

/// A successful response with no image part.
pub fn text_only_response(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"parts": [{"text": text}]}
        }]
    })
}
