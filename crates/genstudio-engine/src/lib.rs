pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod remote;
pub mod request;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod upload;

use std::sync::Arc;

use anyhow::{Context, Result};
use genstudio_contracts::events::EventSink;
use genstudio_contracts::jobs::{JobHandle, JobStatus};
use genstudio_contracts::media::ImagePayload;
use genstudio_contracts::models::{ModelSelector, CAP_EDIT, CAP_IMAGE, CAP_VIDEO};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub use backend::{
    DownloadedAsset, GeminiHttpBackend, GenerationOptions, ImageBackend, VideoBackend, VideoRequest,
};
pub use clock::{CancellationToken, RecordingSleeper, Sleeper, ThreadSleeper};
pub use config::StudioConfig;
pub use error::{ErrorKind, StudioError, StudioResult};
pub use orchestrator::{GenerationOutcome, Orchestrator, OrchestratorState, RequestVariant, RetryState};
pub use poller::{JobPoller, PollOutcome, PollerState};
pub use remote::RemoteStudioClient;
pub use request::{GenerationMode, GenerationRequest, MultipartPayload, RequestBuilder};
pub use upload::{PreviewStore, ProcessedUpload, UploadProcessor};

/// Entry point shared by the CLI and the HTTP server. Each image call gets
/// its own orchestrator, so concurrent callers never observe each other's
/// retry state.
pub struct StudioEngine {
    config: StudioConfig,
    images: Arc<dyn ImageBackend>,
    videos: Arc<dyn VideoBackend>,
    events: Arc<dyn EventSink>,
    sleeper: Arc<dyn Sleeper>,
    previews: PreviewStore,
    model_selector: ModelSelector,
    fallback_image: Option<ImagePayload>,
}

impl StudioEngine {
    pub fn new(config: StudioConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let backend = Arc::new(
            GeminiHttpBackend::new(&config).context("failed to initialize Gemini backend")?,
        );
        emit(
            events.as_ref(),
            "engine_started",
            json!({
                "api_base": config.api_base,
                "image_model": config.image_model,
                "video_model": config.video_model,
            }),
        );
        Ok(Self::with_backends(
            config,
            backend.clone(),
            backend,
            events,
            Arc::new(ThreadSleeper),
        ))
    }

    pub fn with_backends(
        config: StudioConfig,
        images: Arc<dyn ImageBackend>,
        videos: Arc<dyn VideoBackend>,
        events: Arc<dyn EventSink>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            images,
            videos,
            events,
            sleeper,
            previews: PreviewStore::new(),
            model_selector: ModelSelector::default(),
            fallback_image: None,
        }
    }

    /// Image returned in place of a failed generation.
    pub fn with_fallback_image(mut self, fallback: Option<ImagePayload>) -> Self {
        self.fallback_image = fallback;
        self
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    pub fn previews(&self) -> &PreviewStore {
        &self.previews
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.images.clone(),
            self.config.clone(),
            self.sleeper.clone(),
            self.events.clone(),
        )
        .with_fallback_image(self.fallback_image.clone())
    }

    pub fn generate(&self, prompt: &str, model: Option<&str>) -> StudioResult<GenerationOutcome> {
        let model = self.resolve_model(model, CAP_IMAGE, &self.config.image_model);
        self.run(&RequestBuilder::new(prompt), GenerationMode::Generate, model)
    }

    pub fn generate_imagen(&self, prompt: &str, model: Option<&str>) -> StudioResult<GenerationOutcome> {
        let model = self.resolve_model(model, CAP_IMAGE, &self.config.imagen_model);
        self.run(&RequestBuilder::new(prompt), GenerationMode::Generate, model)
    }

    pub fn edit(&self, builder: &RequestBuilder, model: Option<&str>) -> StudioResult<GenerationOutcome> {
        let model = self.resolve_model(model, CAP_EDIT, &self.config.image_model);
        self.run(builder, GenerationMode::Edit, model)
    }

    pub fn edit_simple(&self, builder: &RequestBuilder, model: Option<&str>) -> StudioResult<GenerationOutcome> {
        let model = self.resolve_model(model, CAP_EDIT, &self.config.image_model);
        self.run(builder, GenerationMode::EditSimple, model)
    }

    pub fn compose(&self, builder: &RequestBuilder, model: Option<&str>) -> StudioResult<GenerationOutcome> {
        let model = self.resolve_model(model, CAP_EDIT, &self.config.image_model);
        self.run(builder, GenerationMode::Compose, model)
    }

    fn run(&self, builder: &RequestBuilder, mode: GenerationMode, model: String) -> StudioResult<GenerationOutcome> {
        let request = builder.build(mode, model)?;
        self.orchestrator().submit_with_fallback(&request)
    }

    pub fn start_video(&self, mut request: VideoRequest) -> StudioResult<JobHandle> {
        if request.prompt.trim().is_empty() {
            return Err(StudioError::Validation("Missing prompt".to_string()));
        }
        let requested = Some(request.model.as_str());
        request.model = self.resolve_model(requested, CAP_VIDEO, &self.config.video_model);
        let handle = self.videos.start_video(&request)?;
        emit(
            self.events.as_ref(),
            "job_started",
            json!({
                "name": handle.as_str(),
                "model": request.model,
                "has_image": request.image.is_some(),
            }),
        );
        Ok(handle)
    }

    pub fn operation_status(&self, handle: &JobHandle) -> StudioResult<JobStatus> {
        if handle.as_str().trim().is_empty() {
            return Err(StudioError::Validation("Missing operation name".to_string()));
        }
        self.videos.job_status(handle)
    }

    pub fn download_asset(&self, uri: &str) -> StudioResult<DownloadedAsset> {
        if uri.trim().is_empty() {
            return Err(StudioError::Validation("Missing video URI".to_string()));
        }
        self.videos.download_asset(uri.trim())
    }

    pub fn poller(&self) -> JobPoller {
        JobPoller::new(
            self.videos.clone(),
            self.config.poll_interval,
            self.config.poll_max_attempts,
            self.sleeper.clone(),
            self.events.clone(),
        )
    }

    pub fn wait_for_video(&self, handle: &JobHandle, cancel: &CancellationToken) -> StudioResult<PollOutcome> {
        self.poller().wait(handle, cancel)
    }

    /// Starts a video job and waits for its result.
    pub fn generate_video(&self, request: VideoRequest, cancel: &CancellationToken) -> StudioResult<PollOutcome> {
        let handle = self.start_video(request)?;
        self.wait_for_video(&handle, cancel)
    }

    pub fn process_upload(&self, name: &str, payload: ImagePayload) -> StudioResult<ProcessedUpload> {
        UploadProcessor::new(&self.config, self.previews.clone(), self.events.clone()).process(name, payload)
    }

    fn resolve_model(&self, requested: Option<&str>, capability: &str, default: &str) -> String {
        let choice = self.model_selector.choose(requested, capability, default);
        if let Some(reason) = choice.fallback_reason() {
            emit(
                self.events.as_ref(),
                "model_fallback",
                json!({
                    "requested": requested,
                    "selected": choice.name(),
                    "capability": capability,
                    "reason": reason,
                }),
            );
        }
        choice.into_name()
    }
}

/// Best-effort event emission; a failing sink never fails the call.
pub(crate) fn emit(sink: &dyn EventSink, event_type: &str, payload: Value) {
    let _ = sink.emit(event_type, map_object(payload));
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

pub fn payload_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
