use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use genstudio_contracts::events::EventSink;
use genstudio_contracts::media::{ImagePayload, DEFAULT_IMAGE_MIME};
use genstudio_contracts::models::is_imagen_model;
use serde_json::{json, Value};

use crate::backend::{GenerationOptions, ImageBackend};
use crate::clock::{CancellationToken, Sleeper};
use crate::config::{StudioConfig, MIB};
use crate::error::{ErrorKind, StudioError, StudioResult};
use crate::request::{GenerationMode, GenerationRequest};
use crate::{emit, payload_digest, truncate_chars};

const SIMPLIFIED_PREFIX: &str = "Edit this image based on the following request: ";
const TRUNCATED_PREFIX: &str = "Modify this image: ";
const SIMPLE_EDIT_PREFIX: &str = "Please edit this image: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Submitting,
    Retrying { attempt: u32 },
    Done,
    Failed,
}

impl OrchestratorState {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Submitting | Self::Retrying { .. })
    }
}

/// Shape of the request sent on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVariant {
    Original,
    Simplified,
    Truncated,
    Conservative,
}

impl RequestVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Simplified => "simplified",
            Self::Truncated => "truncated",
            Self::Conservative => "conservative",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub variant: RequestVariant,
    pub prompt: String,
    pub image_count: usize,
    pub error: Option<StudioError>,
}

/// Bookkeeping for one orchestrated call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<StudioError>,
    pub history: Vec<AttemptRecord>,
}

impl RetryState {
    pub fn variants(&self) -> Vec<RequestVariant> {
        self.history.iter().map(|record| record.variant).collect()
    }

    fn record(&mut self, variant: RequestVariant, request: &GenerationRequest, error: Option<StudioError>) {
        self.attempts += 1;
        if let Some(err) = &error {
            self.last_error = Some(err.clone());
        }
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            variant,
            prompt: request.prompt.clone(),
            image_count: request.images.len(),
            error,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub payload: ImagePayload,
    pub fallback_used: bool,
    pub error: Option<StudioError>,
    pub attempts: u32,
}

pub struct Orchestrator {
    backend: Arc<dyn ImageBackend>,
    config: StudioConfig,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
    fallback_image: Option<ImagePayload>,
    state: OrchestratorState,
    last_retry: RetryState,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        config: StudioConfig,
        sleeper: Arc<dyn Sleeper>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            backend,
            config,
            sleeper,
            events,
            fallback_image: None,
            state: OrchestratorState::Idle,
            last_retry: RetryState::default(),
        }
    }

    pub fn with_fallback_image(mut self, fallback: Option<ImagePayload>) -> Self {
        self.fallback_image = fallback;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Attempts of the most recent call.
    pub fn last_retry(&self) -> &RetryState {
        &self.last_retry
    }

    /// Returns to `Idle`, releasing a busy state left behind by a call that
    /// never finished.
    pub fn reset(&mut self) {
        self.state = OrchestratorState::Idle;
        self.last_retry = RetryState::default();
    }

    pub fn submit(&mut self, request: &GenerationRequest) -> StudioResult<ImagePayload> {
        self.submit_cancellable(request, &CancellationToken::new())
    }

    pub fn submit_cancellable(
        &mut self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> StudioResult<ImagePayload> {
        if self.state.is_busy() {
            return Err(StudioError::Busy);
        }
        self.state = OrchestratorState::Submitting;
        emit(
            self.events.as_ref(),
            "generation_started",
            json!({
                "mode": request.mode.as_str(),
                "model": request.model,
                "image_count": request.images.len(),
                "prompt_chars": request.prompt.chars().count(),
            }),
        );

        let mut retry = RetryState::default();
        let result = match request.mode {
            GenerationMode::EditSimple => self.run_simple(request, &mut retry),
            GenerationMode::Edit | GenerationMode::Compose => {
                match self.run_with_retries(request, &mut retry, cancel) {
                    Err(StudioError::ServiceDegraded { .. }) if self.config.simple_fallback => {
                        self.fall_back_to_simple(request, &mut retry)
                    }
                    other => other,
                }
            }
            GenerationMode::Generate => self.run_with_retries(request, &mut retry, cancel),
        };

        match &result {
            Ok(payload) => {
                self.state = OrchestratorState::Done;
                emit(
                    self.events.as_ref(),
                    "generation_succeeded",
                    json!({
                        "attempts": retry.attempts,
                        "variants": retry.variants().iter().map(|v| v.as_str()).collect::<Vec<_>>(),
                        "mime_type": payload.mime_type,
                        "size_bytes": payload.len(),
                        "sha256": payload_digest(&payload.bytes),
                    }),
                );
            }
            Err(err) => {
                self.state = OrchestratorState::Failed;
                emit(
                    self.events.as_ref(),
                    "generation_failed",
                    json!({
                        "attempts": retry.attempts,
                        "kind": err.kind().as_str(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
        self.last_retry = retry;
        result
    }

    /// Like [`Orchestrator::submit`], but substitutes the configured
    /// fallback image for any failure other than input validation.
    pub fn submit_with_fallback(&mut self, request: &GenerationRequest) -> StudioResult<GenerationOutcome> {
        match self.submit(request) {
            Ok(payload) => Ok(GenerationOutcome {
                payload,
                fallback_used: false,
                error: None,
                attempts: self.last_retry.attempts,
            }),
            Err(err) => {
                let substitutable = !matches!(err.kind(), ErrorKind::Validation | ErrorKind::Busy);
                match self.fallback_image.clone() {
                    Some(payload) if substitutable => {
                        emit(
                            self.events.as_ref(),
                            "generation_fallback",
                            json!({ "error": err.to_string(), "mime_type": payload.mime_type }),
                        );
                        Ok(GenerationOutcome {
                            payload,
                            fallback_used: true,
                            error: Some(err),
                            attempts: self.last_retry.attempts,
                        })
                    }
                    _ => Err(err),
                }
            }
        }
    }

    fn run_with_retries(
        &mut self,
        request: &GenerationRequest,
        retry: &mut RetryState,
        cancel: &CancellationToken,
    ) -> StudioResult<ImagePayload> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut variant = RequestVariant::Original;
        let mut current = request.clone();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.state = OrchestratorState::Retrying { attempt };
            }
            emit(
                self.events.as_ref(),
                "generation_attempt",
                json!({
                    "attempt": attempt,
                    "variant": variant.as_str(),
                    "image_count": current.images.len(),
                    "prompt_chars": current.prompt.chars().count(),
                }),
            );

            let err = match self.call_once(&current, &GenerationOptions::standard()) {
                Ok(payload) => {
                    retry.record(variant, &current, None);
                    return Ok(payload);
                }
                Err(err) => err,
            };
            retry.record(variant, &current, Some(err.clone()));

            let delay = match &err {
                StudioError::RateLimited(_) => self.backoff_delay(attempt),
                StudioError::EmptyResult(_) if self.config.retry_empty_result => {
                    self.backoff_delay(attempt)
                }
                StudioError::Service(_) => {
                    variant = next_degraded_variant(attempt);
                    current = degrade_request(request, variant, &self.config);
                    self.config.degrade_delay
                }
                _ => return Err(err),
            };
            if attempt >= max_attempts {
                break;
            }

            emit(
                self.events.as_ref(),
                if matches!(err, StudioError::Service(_)) {
                    "generation_degraded"
                } else {
                    "generation_retry"
                },
                json!({
                    "attempt": attempt,
                    "kind": err.kind().as_str(),
                    "next_variant": variant.as_str(),
                    "delay_ms": delay.as_millis() as u64,
                }),
            );
            if !self.sleeper.sleep(delay, cancel) {
                return Err(StudioError::Cancelled);
            }
        }

        match retry.last_error.clone() {
            Some(StudioError::Service(_)) => Err(StudioError::ServiceDegraded {
                attempts: retry.attempts,
            }),
            Some(err) => Err(err),
            None => Err(StudioError::EmptyResult("No image generated".to_string())),
        }
    }

    /// Single conservative attempt against the first image only.
    fn run_simple(&mut self, request: &GenerationRequest, retry: &mut RetryState) -> StudioResult<ImagePayload> {
        let Some(first) = request.images.first() else {
            return Err(StudioError::Validation("No image file provided".to_string()));
        };
        if first.len() as u64 > self.config.simple_max_bytes {
            return Err(StudioError::Validation(format!(
                "Image file too large for simple processing. Maximum size is {}MB. Current size: {:.2}MB",
                self.config.simple_max_bytes / MIB,
                first.size_mb()
            )));
        }
        let simple = degrade_request(request, RequestVariant::Conservative, &self.config);
        emit(
            self.events.as_ref(),
            "generation_attempt",
            json!({
                "attempt": retry.attempts + 1,
                "variant": RequestVariant::Conservative.as_str(),
                "image_count": simple.images.len(),
                "prompt_chars": simple.prompt.chars().count(),
            }),
        );
        match self.call_once(&simple, &GenerationOptions::conservative()) {
            Ok(payload) => {
                retry.record(RequestVariant::Conservative, &simple, None);
                Ok(payload)
            }
            Err(err) => {
                retry.record(RequestVariant::Conservative, &simple, Some(err.clone()));
                Err(err)
            }
        }
    }

    fn fall_back_to_simple(
        &mut self,
        request: &GenerationRequest,
        retry: &mut RetryState,
    ) -> StudioResult<ImagePayload> {
        let degraded = StudioError::ServiceDegraded {
            attempts: retry.attempts,
        };
        emit(
            self.events.as_ref(),
            "generation_degraded",
            json!({
                "attempt": retry.attempts,
                "kind": ErrorKind::Service.as_str(),
                "next_variant": RequestVariant::Conservative.as_str(),
                "delay_ms": 0,
            }),
        );
        match self.run_simple(request, retry) {
            Ok(payload) => Ok(payload),
            Err(StudioError::Validation(_)) => Err(degraded),
            Err(StudioError::Service(_)) => Err(StudioError::ServiceDegraded {
                attempts: retry.attempts,
            }),
            Err(other) => Err(other),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config.backoff_base.saturating_mul(factor)
    }

    fn call_once(&self, request: &GenerationRequest, options: &GenerationOptions) -> StudioResult<ImagePayload> {
        if is_imagen_model(&request.model) && request.images.is_empty() {
            let response = self.backend.predict_image(&request.model, &request.prompt)?;
            return extract_prediction_image(&response);
        }
        let response = self
            .backend
            .generate_content(&request.model, &request.content_parts(), options)?;
        extract_inline_image(&response, self.events.as_ref())
    }
}

/// Never returns more characters than `prompt` has.
fn shorten_prompt(prompt: &str, prefix: Option<&str>, max_chars: usize) -> String {
    let cut = truncate_chars(prompt, max_chars);
    match prefix {
        Some(prefix) if prefix.chars().count() + cut.chars().count() < prompt.chars().count() => {
            format!("{prefix}{cut}")
        }
        _ => cut,
    }
}

fn next_degraded_variant(failed_attempt: u32) -> RequestVariant {
    if failed_attempt <= 1 {
        RequestVariant::Simplified
    } else {
        RequestVariant::Truncated
    }
}

/// Derives the reduced request for `variant`. Image requests keep only the
/// first image and wrap the prompt in a short instruction when that still
/// comes out shorter than the original; otherwise the prompt is only cut.
pub fn degrade_request(
    request: &GenerationRequest,
    variant: RequestVariant,
    config: &StudioConfig,
) -> GenerationRequest {
    let has_images = !request.images.is_empty();
    let prompt = match variant {
        RequestVariant::Original => request.prompt.clone(),
        RequestVariant::Simplified => shorten_prompt(
            &request.prompt,
            has_images.then_some(SIMPLIFIED_PREFIX),
            config.simplified_prompt_chars,
        ),
        RequestVariant::Truncated => shorten_prompt(
            &request.prompt,
            has_images.then_some(TRUNCATED_PREFIX),
            config.truncated_prompt_chars,
        ),
        RequestVariant::Conservative => format!("{SIMPLE_EDIT_PREFIX}{}", request.prompt),
    };
    let images = match variant {
        RequestVariant::Original => request.images.clone(),
        _ => request.images.iter().take(1).cloned().collect(),
    };
    GenerationRequest {
        prompt,
        images,
        mode: request.mode,
        model: request.model.clone(),
    }
}

/// First inline image among the response parts. Text parts seen before it
/// are forwarded to the event sink.
pub fn extract_inline_image(response: &Value, events: &dyn EventSink) -> StudioResult<ImagePayload> {
    let Some(candidates) = response
        .get("candidates")
        .and_then(Value::as_array)
        .filter(|rows| !rows.is_empty())
    else {
        return Err(StudioError::EmptyResult(
            "Invalid response from Gemini API".to_string(),
        ));
    };

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array);
        for part in parts.into_iter().flatten() {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                emit(events, "model_text", json!({ "text": text }));
                continue;
            }
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                StudioError::EmptyResult(format!("Gemini image base64 decode failed: {err}"))
            })?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_IMAGE_MIME);
            return Ok(ImagePayload::new(bytes, mime_type));
        }
    }
    Err(StudioError::EmptyResult("No image generated".to_string()))
}

pub fn extract_prediction_image(response: &Value) -> StudioResult<ImagePayload> {
    let prediction = response
        .get("predictions")
        .and_then(Value::as_array)
        .and_then(|rows| {
            rows.iter().find(|row| {
                row.get("bytesBase64Encoded")
                    .and_then(Value::as_str)
                    .is_some_and(|data| !data.is_empty())
            })
        })
        .ok_or_else(|| StudioError::EmptyResult("No image generated".to_string()))?;
    let data = prediction
        .get("bytesBase64Encoded")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let bytes = BASE64
        .decode(data.as_bytes())
        .map_err(|err| StudioError::EmptyResult(format!("Imagen image base64 decode failed: {err}")))?;
    let mime_type = prediction
        .get("mimeType")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_IMAGE_MIME);
    Ok(ImagePayload::new(bytes, mime_type))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use genstudio_contracts::events::MemoryEventSink;

    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::request::ContentPart;
    use crate::testing::{image_response, text_only_response, ScriptedImageBackend};

    struct Harness {
        backend: Arc<ScriptedImageBackend>,
        sleeper: RecordingSleeper,
        events: Arc<MemoryEventSink>,
        orchestrator: Orchestrator,
    }

    fn harness(script: Vec<StudioResult<Value>>, config: StudioConfig) -> Harness {
        let backend = Arc::new(ScriptedImageBackend::new(script));
        let sleeper = RecordingSleeper::new();
        let events = Arc::new(MemoryEventSink::new("test"));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            config,
            Arc::new(sleeper.clone()),
            events.clone(),
        );
        Harness {
            backend,
            sleeper,
            events,
            orchestrator,
        }
    }

    fn compose_request(prompt: &str) -> GenerationRequest {
        GenerationRequest::new(prompt, GenerationMode::Compose, "gemini-2.5-flash-image-preview")
            .with_images(vec![
                ImagePayload::new(vec![1; 8], "image/png"),
                ImagePayload::new(vec![2; 8], "image/png"),
                ImagePayload::new(vec![3; 8], "image/jpeg"),
            ])
    }

    fn server_error() -> StudioResult<Value> {
        Err(StudioError::from_status(500, "Internal error"))
    }

    #[test]
    fn two_server_errors_then_success_degrades_each_attempt() {
        let long_prompt = "make the sky a deep orange sunset ".repeat(20);
        let mut h = harness(
            vec![server_error(), server_error(), Ok(image_response(&[9, 9, 9], "image/png"))],
            StudioConfig::default(),
        );

        let payload = h.orchestrator.submit(&compose_request(&long_prompt)).unwrap();
        assert_eq!(payload, ImagePayload::new(vec![9, 9, 9], "image/png"));
        assert_eq!(h.orchestrator.state(), OrchestratorState::Done);

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].image_count, 3);
        assert_eq!(calls[1].image_count, 1);
        assert!(calls[1].prompt.chars().count() < calls[0].prompt.chars().count());
        assert!(calls[1].prompt.starts_with(SIMPLIFIED_PREFIX));
        assert_eq!(calls[1].first_image.as_ref().map(|image| image.bytes[0]), Some(1));
        assert_eq!(
            calls[2].prompt,
            format!("{TRUNCATED_PREFIX}{}", long_prompt.chars().take(100).collect::<String>())
        );

        let retry = h.orchestrator.last_retry();
        assert_eq!(retry.attempts, 3);
        assert_eq!(
            retry.variants(),
            vec![
                RequestVariant::Original,
                RequestVariant::Simplified,
                RequestVariant::Truncated
            ]
        );
        assert_eq!(
            h.sleeper.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(2)]
        );
    }

    #[test]
    fn bad_request_fails_after_one_attempt() {
        let mut h = harness(
            vec![Err(StudioError::from_status(400, "bad image"))],
            StudioConfig::default(),
        );
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(h.backend.calls().len(), 1);
        assert!(h.sleeper.delays().is_empty());
        assert_eq!(h.orchestrator.state(), OrchestratorState::Failed);
    }

    #[test]
    fn rate_limits_back_off_exponentially_with_identical_requests() {
        let mut h = harness(
            vec![
                Err(StudioError::from_status(429, "slow down")),
                Err(StudioError::from_status(429, "slow down")),
                Ok(image_response(&[1], "image/webp")),
            ],
            StudioConfig::default(),
        );
        let request = compose_request("tint");
        h.orchestrator.submit(&request).unwrap();

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|call| call.prompt == "tint" && call.image_count == 3));
        assert_eq!(
            h.sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(h.events.types().contains(&"generation_retry".to_string()));
    }

    #[test]
    fn exhausted_rate_limit_surfaces_directly() {
        let mut h = harness(
            vec![
                Err(StudioError::from_status(429, "a")),
                Err(StudioError::from_status(429, "b")),
                Err(StudioError::from_status(429, "c")),
            ],
            StudioConfig::default(),
        );
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(err, StudioError::RateLimited("c".to_string()));
        assert_eq!(h.sleeper.delays().len(), 2);
    }

    #[test]
    fn exhausted_server_errors_become_service_degraded() {
        let mut config = StudioConfig::default();
        config.simple_fallback = false;
        let mut h = harness(vec![server_error(), server_error(), server_error()], config);
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(err, StudioError::ServiceDegraded { attempts: 3 });
        assert_eq!(h.backend.calls().len(), 3);
    }

    #[test]
    fn simple_fallback_runs_once_after_degradation() {
        let mut h = harness(
            vec![
                server_error(),
                server_error(),
                server_error(),
                Ok(image_response(&[4, 2], "image/png")),
            ],
            StudioConfig::default(),
        );
        let payload = h.orchestrator.submit(&compose_request("tint")).unwrap();
        assert_eq!(payload.bytes, vec![4, 2]);

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3].prompt, "Please edit this image: tint");
        assert_eq!(calls[3].options, GenerationOptions::conservative());
        assert_eq!(
            h.orchestrator.last_retry().variants().last(),
            Some(&RequestVariant::Conservative)
        );
    }

    #[test]
    fn simple_fallback_failure_still_reports_degraded() {
        let mut h = harness(
            vec![server_error(), server_error(), server_error(), server_error()],
            StudioConfig::default(),
        );
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(err, StudioError::ServiceDegraded { attempts: 4 });
    }

    #[test]
    fn success_without_image_is_empty_result_by_default() {
        let mut h = harness(
            vec![Ok(text_only_response("I cannot draw that"))],
            StudioConfig::default(),
        );
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(err, StudioError::EmptyResult("No image generated".to_string()));
        assert_eq!(h.backend.calls().len(), 1);

        let model_text = h
            .events
            .events()
            .into_iter()
            .find(|event| event["type"] == "model_text")
            .unwrap();
        assert_eq!(model_text["text"], "I cannot draw that");
    }

    #[test]
    fn empty_result_is_retried_when_policy_enabled() {
        let mut config = StudioConfig::default();
        config.retry_empty_result = true;
        let mut h = harness(
            vec![
                Ok(text_only_response("hmm")),
                Ok(image_response(&[5], "image/png")),
            ],
            config,
        );
        let payload = h.orchestrator.submit(&compose_request("tint")).unwrap();
        assert_eq!(payload.bytes, vec![5]);
        assert_eq!(h.backend.calls()[1].prompt, "tint");
        assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn network_failure_is_terminal() {
        let mut h = harness(
            vec![Err(StudioError::Network("connection reset".to_string()))],
            StudioConfig::default(),
        );
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(h.backend.calls().len(), 1);
    }

    #[test]
    fn missing_candidates_is_invalid_response() {
        let mut h = harness(vec![Ok(json!({"candidates": []}))], StudioConfig::default());
        let err = h.orchestrator.submit(&compose_request("tint")).unwrap_err();
        assert_eq!(
            err,
            StudioError::EmptyResult("Invalid response from Gemini API".to_string())
        );
    }

    #[test]
    fn edit_simple_enforces_ten_megabyte_limit() {
        let mut h = harness(vec![], StudioConfig::default());
        let big = ImagePayload::new(vec![0; (10 * MIB + 1) as usize], "image/png");
        let request = GenerationRequest::new("tint", GenerationMode::EditSimple, "m")
            .with_images(vec![big]);
        let err = h.orchestrator.submit(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn edit_simple_is_a_single_attempt() {
        let mut h = harness(vec![server_error()], StudioConfig::default());
        let request = GenerationRequest::new("tint", GenerationMode::EditSimple, "m")
            .with_images(vec![ImagePayload::new(vec![1; 8], "image/png")]);
        let err = h.orchestrator.submit(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Service);
        assert_eq!(h.backend.calls().len(), 1);
    }

    #[test]
    fn imagen_models_use_predict_endpoint() {
        let mut h = harness(
            vec![Ok(json!({"predictions": [{"bytesBase64Encoded": "AQID", "mimeType": "image/jpeg"}]}))],
            StudioConfig::default(),
        );
        let request = GenerationRequest::new("a red kite", GenerationMode::Generate, "imagen-4.0-generate-001");
        let payload = h.orchestrator.submit(&request).unwrap();
        assert_eq!(payload, ImagePayload::new(vec![1, 2, 3], "image/jpeg"));
        assert_eq!(h.backend.calls()[0].endpoint, "predict");
    }

    #[test]
    fn text_only_requests_degrade_by_truncation() {
        let config = StudioConfig::default();
        let request = GenerationRequest::new("x".repeat(500), GenerationMode::Generate, "m");
        let simplified = degrade_request(&request, RequestVariant::Simplified, &config);
        assert_eq!(simplified.prompt.chars().count(), config.simplified_prompt_chars);
        let truncated = degrade_request(&request, RequestVariant::Truncated, &config);
        assert_eq!(truncated.prompt.chars().count(), 100);
        assert!(truncated.images.is_empty());
    }

    #[test]
    fn short_prompts_are_never_lengthened_when_degraded() {
        let mut h = harness(
            vec![server_error(), server_error(), Ok(image_response(&[4], "image/png"))],
            StudioConfig::default(),
        );
        h.orchestrator.submit(&compose_request("make it blue")).unwrap();

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 3);
        for degraded in &calls[1..] {
            assert_eq!(degraded.prompt, "make it blue");
            assert_eq!(degraded.image_count, 1);
        }
    }

    #[test]
    fn degraded_prompts_drop_the_prefix_once_it_stops_paying_off() {
        let config = StudioConfig::default();
        let prompt = "y".repeat(120);
        let request = compose_request(&prompt);
        let simplified = degrade_request(&request, RequestVariant::Simplified, &config);
        assert_eq!(simplified.prompt, prompt);
        let truncated = degrade_request(&request, RequestVariant::Truncated, &config);
        assert_eq!(truncated.prompt, format!("{TRUNCATED_PREFIX}{}", "y".repeat(100)));
        assert!(truncated.prompt.chars().count() < prompt.chars().count());
    }

    #[test]
    fn fallback_image_replaces_terminal_failure() {
        let h = harness(
            vec![Err(StudioError::from_status(400, "bad"))],
            StudioConfig::default(),
        );
        let fallback = ImagePayload::new(vec![7; 4], "image/png");
        let mut orchestrator = h.orchestrator.with_fallback_image(Some(fallback.clone()));
        let outcome = orchestrator.submit_with_fallback(&compose_request("tint")).unwrap();
        assert!(outcome.fallback_used);
        assert_eq!(outcome.payload, fallback);
        assert_eq!(outcome.error.map(|err| err.kind()), Some(ErrorKind::BadRequest));
        assert!(h.events.types().contains(&"generation_fallback".to_string()));
    }

    #[test]
    fn fallback_image_never_masks_validation() {
        let h = harness(vec![], StudioConfig::default());
        let mut orchestrator = h
            .orchestrator
            .with_fallback_image(Some(ImagePayload::new(vec![7; 4], "image/png")));
        let request = GenerationRequest::new("tint", GenerationMode::EditSimple, "m");
        let err = orchestrator.submit_with_fallback(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn events_trace_the_whole_call() {
        let mut h = harness(
            vec![server_error(), Ok(image_response(&[1], "image/png"))],
            StudioConfig::default(),
        );
        h.orchestrator.submit(&compose_request("tint")).unwrap();
        assert_eq!(
            h.events.types(),
            vec![
                "generation_started",
                "generation_attempt",
                "generation_degraded",
                "generation_attempt",
                "model_text",
                "generation_succeeded"
            ]
        );
    }

    /// Panics on its first call, then answers with an image.
    struct PanicOnceBackend {
        panicked: AtomicBool,
    }

    impl ImageBackend for PanicOnceBackend {
        fn generate_content(
            &self,
            _: &str,
            _: &[ContentPart],
            _: &GenerationOptions,
        ) -> StudioResult<Value> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("backend blew up");
            }
            Ok(image_response(&[5], "image/png"))
        }

        fn predict_image(&self, _: &str, _: &str) -> StudioResult<Value> {
            panic!("backend blew up");
        }
    }

    #[test]
    fn abandoned_call_stays_busy_until_reset() {
        let mut orchestrator = Orchestrator::new(
            Arc::new(PanicOnceBackend {
                panicked: AtomicBool::new(false),
            }),
            StudioConfig::default(),
            Arc::new(RecordingSleeper::new()),
            Arc::new(MemoryEventSink::new("test")),
        );
        let request = compose_request("tint");
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = orchestrator.submit(&request);
        }));
        assert!(unwound.is_err());
        assert!(orchestrator.state().is_busy());
        assert_eq!(orchestrator.submit(&request).unwrap_err(), StudioError::Busy);

        orchestrator.reset();
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        let payload = orchestrator.submit(&request).unwrap();
        assert_eq!(payload.bytes, vec![5]);
        assert_eq!(orchestrator.state(), OrchestratorState::Done);
    }

    #[test]
    fn cancellation_during_backoff_stops_retries() {
        let mut h = harness(
            vec![Err(StudioError::from_status(429, "slow"))],
            StudioConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .orchestrator
            .submit_cancellable(&compose_request("tint"), &cancel)
            .unwrap_err();
        assert_eq!(err, StudioError::Cancelled);
        assert_eq!(h.backend.calls().len(), 1);
    }
}
