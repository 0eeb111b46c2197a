use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use genstudio_contracts::api::{
    DownloadBody, ErrorBody, ImageBody, OperationBody, PromptBody, ROUTE_GEMINI_EDIT,
    ROUTE_GEMINI_EDIT_SIMPLE, ROUTE_GEMINI_GENERATE, ROUTE_IMAGEN_GENERATE, ROUTE_VEO_DOWNLOAD,
    ROUTE_VEO_GENERATE, ROUTE_VEO_OPERATION,
};
use genstudio_contracts::events::{EventPayload, EventSink};
use genstudio_contracts::jobs::{JobHandle, JobStatus};
use genstudio_contracts::media::{mime_for_path, DEFAULT_IMAGE_MIME};
use genstudio_engine::config::MIB;
use genstudio_engine::request::{
    FIELD_ASPECT_RATIO, FIELD_MODEL, FIELD_NEGATIVE_PROMPT, FIELD_PROMPT,
};
use genstudio_engine::{
    GenerationOutcome, MultipartPayload, StudioEngine, StudioError, StudioResult, VideoRequest,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub type AppState = Arc<StudioEngine>;

const DEFAULT_VIDEO_MIME: &str = "video/mp4";

/// Forwards engine events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let payload = Value::Object(payload);
        if event_type.ends_with("_failed") {
            tracing::warn!(event = event_type, payload = %payload, "engine event");
        } else {
            tracing::info!(event = event_type, payload = %payload, "engine event");
        }
        Ok(payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Studio(#[from] StudioError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Studio(err) => (
                StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                err.user_message(),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
        };
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub fn router(engine: Arc<StudioEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(ROUTE_GEMINI_GENERATE, post(gemini_generate))
        .route(ROUTE_IMAGEN_GENERATE, post(imagen_generate))
        .route(ROUTE_GEMINI_EDIT, post(gemini_edit))
        .route(ROUTE_GEMINI_EDIT_SIMPLE, post(gemini_edit_simple))
        .route(ROUTE_VEO_GENERATE, post(veo_generate))
        .route(ROUTE_VEO_OPERATION, post(veo_operation))
        .route(ROUTE_VEO_DOWNLOAD, post(veo_download))
        .layer(DefaultBodyLimit::max((64 * MIB) as usize))
        .with_state(engine)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "genstudio=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub async fn serve(addr: SocketAddr, engine: Arc<StudioEngine>) -> Result<()> {
    let app = router(engine).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("genstudio listening on http://{addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Runs a blocking engine call off the async workers.
async fn run_blocking<T, F>(engine: AppState, job: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&StudioEngine) -> StudioResult<T> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || job(&engine))
        .await
        .map_err(|err| ApiError::Internal(format!("engine task failed: {err}")))?;
    Ok(result?)
}

fn image_response(outcome: GenerationOutcome) -> Json<ImageBody> {
    if outcome.fallback_used {
        tracing::warn!(
            error = ?outcome.error.as_ref().map(ToString::to_string),
            "returning fallback image"
        );
    }
    Json(ImageBody::from_payload(&outcome.payload))
}

async fn gemini_generate(
    State(engine): State<AppState>,
    Json(body): Json<PromptBody>,
) -> ApiResult<Json<ImageBody>> {
    let outcome = run_blocking(engine, move |engine| {
        engine.generate(&body.prompt, body.model.as_deref())
    })
    .await?;
    Ok(image_response(outcome))
}

async fn imagen_generate(
    State(engine): State<AppState>,
    Json(body): Json<PromptBody>,
) -> ApiResult<Json<ImageBody>> {
    let outcome = run_blocking(engine, move |engine| {
        engine.generate_imagen(&body.prompt, body.model.as_deref())
    })
    .await?;
    Ok(image_response(outcome))
}

async fn gemini_edit(
    State(engine): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ImageBody>> {
    let form = read_multipart(multipart).await?;
    let outcome = run_blocking(engine, move |engine| {
        let builder = form.to_builder()?;
        engine.edit(&builder, form.text(FIELD_MODEL))
    })
    .await?;
    Ok(image_response(outcome))
}

async fn gemini_edit_simple(
    State(engine): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ImageBody>> {
    let form = read_multipart(multipart).await?;
    let outcome = run_blocking(engine, move |engine| {
        let builder = form.to_builder()?;
        engine.edit_simple(&builder, form.text(FIELD_MODEL))
    })
    .await?;
    Ok(image_response(outcome))
}

async fn veo_generate(
    State(engine): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<OperationBody>> {
    let form = read_multipart(multipart).await?;
    let handle = run_blocking(engine, move |engine| {
        let request = video_request_from_form(&form)?;
        engine.start_video(request)
    })
    .await?;
    Ok(Json(OperationBody {
        name: handle.as_str().to_string(),
    }))
}

async fn veo_operation(
    State(engine): State<AppState>,
    Json(body): Json<OperationBody>,
) -> ApiResult<Json<JobStatus>> {
    let status = run_blocking(engine, move |engine| {
        engine.operation_status(&JobHandle::new(body.name))
    })
    .await?;
    Ok(Json(status))
}

async fn veo_download(
    State(engine): State<AppState>,
    Json(body): Json<DownloadBody>,
) -> ApiResult<Response> {
    let asset = run_blocking(engine, move |engine| engine.download_asset(&body.uri)).await?;
    let content_type = asset
        .content_type
        .unwrap_or_else(|| DEFAULT_VIDEO_MIME.to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], Bytes::from(asset.bytes)).into_response())
}

/// Collects every field; parts carrying a file name become file parts.
async fn read_multipart(multipart: Result<Multipart, MultipartRejection>) -> ApiResult<MultipartPayload> {
    let mut multipart =
        multipart.map_err(|_| ApiError::bad_request("Expected multipart/form-data"))?;
    let mut form = MultipartPayload::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Multipart error: {err}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let mime_type = field
                    .content_type()
                    .map(str::to_string)
                    .filter(|value| value != "application/octet-stream")
                    .or_else(|| mime_for_path(Path::new(&file_name)).map(str::to_string))
                    .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("File read error: {err}")))?;
                form.push_file(name, file_name, mime_type, bytes.to_vec());
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("Field read error: {err}")))?;
                form.push_text(name, text);
            }
        }
    }
    Ok(form)
}

fn video_request_from_form(form: &MultipartPayload) -> StudioResult<VideoRequest> {
    let prompt = form
        .text_value(FIELD_PROMPT)
        .ok_or_else(|| StudioError::Validation("Missing prompt".to_string()))?;
    let mut request = VideoRequest::new(prompt, form.text_value(FIELD_MODEL).unwrap_or_default());
    request.negative_prompt = form.text_value(FIELD_NEGATIVE_PROMPT);
    request.aspect_ratio = form.text_value(FIELD_ASPECT_RATIO);
    let built = form
        .to_builder()?
        .build(genstudio_engine::GenerationMode::Generate, request.model.clone())?;
    request.image = built.images.into_iter().next();
    Ok(request)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use genstudio_contracts::events::MemoryEventSink;
    use genstudio_engine::testing::{image_response as scripted_image, ScriptedImageBackend, ScriptedVideoBackend};
    use genstudio_engine::{RecordingSleeper, StudioConfig};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    const BOUNDARY: &str = "genstudio-test-boundary";

    struct Fixture {
        app: Router,
        images: Arc<ScriptedImageBackend>,
        videos: Arc<ScriptedVideoBackend>,
    }

    fn fixture(script: Vec<StudioResult<Value>>, statuses: Vec<StudioResult<JobStatus>>) -> Fixture {
        let images = Arc::new(ScriptedImageBackend::new(script));
        let videos = Arc::new(ScriptedVideoBackend::new(statuses));
        let engine = StudioEngine::with_backends(
            StudioConfig::default().without_delays(),
            images.clone(),
            videos.clone(),
            Arc::new(MemoryEventSink::new("server-test")),
            Arc::new(RecordingSleeper::new()),
        );
        Fixture {
            app: router(Arc::new(engine)),
            images,
            videos,
        }
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(uri: &str, fields: &[(&str, &str)], files: &[(&str, &str, &str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, file_name, mime, bytes) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn read_json(response: Response) -> anyhow::Result<Value> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn health_reports_ok() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let response = fx
            .app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await?["status"], "ok");
        Ok(())
    }

    #[tokio::test]
    async fn generate_returns_image_body() -> anyhow::Result<()> {
        let fx = fixture(vec![Ok(scripted_image(&[1, 2, 3], "image/png"))], vec![]);
        let response = fx
            .app
            .oneshot(json_request(ROUTE_GEMINI_GENERATE, json!({"prompt": "a red kite"})))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["image"]["imageBytes"], "AQID");
        assert_eq!(body["image"]["mimeType"], "image/png");
        Ok(())
    }

    #[tokio::test]
    async fn missing_prompt_is_bad_request() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let response = fx
            .app
            .oneshot(json_request(ROUTE_GEMINI_GENERATE, json!({})))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await?["error"], "Missing prompt");
        assert!(fx.images.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn edit_rejects_json_body() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let response = fx
            .app
            .oneshot(json_request(ROUTE_GEMINI_EDIT, json!({"prompt": "x"})))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await?["error"], "Expected multipart/form-data");
        Ok(())
    }

    #[tokio::test]
    async fn edit_without_images_is_rejected() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let response = fx
            .app
            .oneshot(multipart_request(ROUTE_GEMINI_EDIT, &[("prompt", "tint it")], &[]))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await?["error"], "No images provided for editing");
        Ok(())
    }

    #[tokio::test]
    async fn edit_sends_prompt_then_every_image() -> anyhow::Result<()> {
        let fx = fixture(vec![Ok(scripted_image(&[7], "image/png"))], vec![]);
        let first = vec![1u8; 32];
        let second = vec![2u8; 32];
        let response = fx
            .app
            .oneshot(multipart_request(
                ROUTE_GEMINI_EDIT,
                &[("prompt", "blend these")],
                &[
                    ("imageFiles", "a.png", "image/png", first.as_slice()),
                    ("imageFiles", "b.jpg", "image/jpeg", second.as_slice()),
                ],
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let calls = fx.images.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompt, "blend these");
        assert_eq!(calls[0].image_count, 2);
        assert_eq!(calls[0].first_image.as_ref().map(|image| image.bytes.clone()), Some(first));
        Ok(())
    }

    #[tokio::test]
    async fn edit_accepts_base64_field() -> anyhow::Result<()> {
        let fx = fixture(vec![Ok(scripted_image(&[7], "image/png"))], vec![]);
        let data_url = format!("data:image/png;base64,{}", BASE64.encode([5u8; 24]));
        let response = fx
            .app
            .oneshot(multipart_request(
                ROUTE_GEMINI_EDIT,
                &[("prompt", "sharpen"), ("imageBase64", data_url.as_str()), ("imageMimeType", "image/png")],
                &[],
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fx.images.calls()[0].image_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_is_reported_after_retries() -> anyhow::Result<()> {
        let fx = fixture(
            vec![
                Err(StudioError::from_status(429, "quota")),
                Err(StudioError::from_status(429, "quota")),
                Err(StudioError::from_status(429, "quota")),
            ],
            vec![],
        );
        let response = fx
            .app
            .oneshot(json_request(ROUTE_GEMINI_GENERATE, json!({"prompt": "x"})))
            .await?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            read_json(response).await?["error"],
            "Rate limit exceeded. Please wait a moment before trying again."
        );
        Ok(())
    }

    #[tokio::test]
    async fn veo_generate_returns_operation_name() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let response = fx
            .app
            .oneshot(multipart_request(
                ROUTE_VEO_GENERATE,
                &[("prompt", "waves"), ("aspectRatio", "16:9")],
                &[],
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await?["name"], ScriptedVideoBackend::HANDLE);
        let started = fx.videos.started();
        assert_eq!(started[0].aspect_ratio.as_deref(), Some("16:9"));
        assert!(started[0].image.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn veo_generate_rejects_unsupported_start_image() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let bitmap = vec![0x42u8; 16];
        let response = fx
            .app
            .oneshot(multipart_request(
                ROUTE_VEO_GENERATE,
                &[("prompt", "waves")],
                &[("imageFile", "frame.bmp", "image/bmp", bitmap.as_slice())],
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await?;
        assert!(body["error"]
            .as_str()
            .is_some_and(|message| message.starts_with("Unsupported image format: image/bmp")));
        assert!(fx.videos.started().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn veo_generate_attaches_start_image() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let frame = vec![9u8; 16];
        let response = fx
            .app
            .oneshot(multipart_request(
                ROUTE_VEO_GENERATE,
                &[("prompt", "waves")],
                &[("imageFile", "frame.png", "image/png", frame.as_slice())],
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let started = fx.videos.started();
        assert_eq!(started[0].image.as_ref().map(|image| image.bytes.clone()), Some(frame));
        Ok(())
    }

    #[tokio::test]
    async fn veo_operation_reports_status() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![Ok(JobStatus::completed("https://files.example/v.mp4"))]);
        let response = fx
            .app
            .oneshot(json_request(ROUTE_VEO_OPERATION, json!({"name": "operations/1"})))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await?;
        assert_eq!(body["done"], true);
        assert_eq!(body["uri"], "https://files.example/v.mp4");
        Ok(())
    }

    #[tokio::test]
    async fn veo_download_streams_bytes() -> anyhow::Result<()> {
        let fx = fixture(vec![], vec![]);
        let response = fx
            .app
            .oneshot(json_request(ROUTE_VEO_DOWNLOAD, json!({"uri": "https://files.example/v.mp4"})))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        assert!(!bytes.is_empty());
        assert_eq!(fx.videos.downloads(), vec!["https://files.example/v.mp4".to_string()]);
        Ok(())
    }
}
