use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::cam;
use crate::classifier::Classification;
use crate::detector::Detection;
use crate::error::PipelineError;
use crate::fusion;
use crate::helpers;
use crate::model::{ModelRegistry, RegistryConfig};
use crate::preprocess::{self, PreprocessConfig};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub request_budget: Duration,
}

impl AppState {
    pub fn new(config: RegistryConfig, request_budget: Duration) -> Self {
        Self {
            registry: Arc::new(ModelRegistry::new(config)),
            request_budget,
        }
    }
}

/// Request-boundary failures, mapped onto the HTTP contract. Every pipeline
/// error is logged here and converted to a structured response; nothing
/// escapes as an unhandled fault.
pub enum ApiError {
    Pipeline(PipelineError),
    Timeout,
    InvalidUpload(String),
    NoDetections,
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Pipeline(PipelineError::UnsupportedImage(msg)) => (
                StatusCode::BAD_REQUEST,
                json!({ "detail": format!("Error processing image: unsupported image: {msg}") }),
            ),
            ApiError::Pipeline(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": format!("Error processing image: {err}") }),
            ),
            ApiError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "detail": "Error processing image: request timed out" }),
            ),
            ApiError::InvalidUpload(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "detail": format!("Error processing image: {msg}") }),
            ),
            ApiError::NoDetections => (
                StatusCode::BAD_REQUEST,
                json!({ "message": "No disease detected, heatmap not generated." }),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "detail": format!("Error processing image: {msg}") }),
            ),
        };

        if status.is_server_error() {
            error!(%status, response = %body, "request failed");
        } else {
            warn!(%status, response = %body, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct DetectionBody {
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub confidence: f32,
    #[serde(rename = "class")]
    pub class_id: usize,
    pub class_name: String,
}

impl From<Detection> for DetectionBody {
    fn from(d: Detection) -> Self {
        Self {
            bbox: d.bbox,
            confidence: d.confidence,
            class_id: d.class_id,
            class_name: d.class_name,
        }
    }
}

#[derive(Serialize)]
pub struct ClassificationBody {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

impl From<Classification> for ClassificationBody {
    fn from(c: Classification) -> Self {
        Self {
            class_id: c.class_id,
            class_name: c.class_name,
            confidence: c.confidence,
        }
    }
}

#[derive(Serialize)]
pub struct DetectResponse {
    pub yolo_detections: Vec<DetectionBody>,
    pub mobilenet_classification: ClassificationBody,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/detect", post(detect))
        .route("/detect_with_gradcam", post(detect_with_gradcam))
        .route("/detect_with_boxes", post(detect_with_boxes))
        .route("/detect_with_combined_heatmap", post(detect_with_combined_heatmap))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(addr: &str, state: AppState) -> Result<(), std::io::Error> {
    tracing::info!("listening on {}", addr);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await
}

async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Image Detection API" }))
}

/// Fan the upload across both models: detector boxes plus a whole-image
/// classification.
async fn detect(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let detector = state.registry.detector().await?;
    let classifier = state.registry.classifier().await?;

    let response = run_blocking(&state, move || {
        let image = preprocess::decode_image(&upload)?;
        let detections = detector.blocking_lock().detect(&image)?;
        let classification = {
            let model = classifier.blocking_lock();
            let input =
                preprocess::classifier_tensor(&image, &PreprocessConfig::classifier(), model.device())?;
            model.classify(&input)?
        };
        Ok(DetectResponse {
            yolo_detections: detections.into_iter().map(Into::into).collect(),
            mobilenet_classification: classification.into(),
        })
    })
    .await?;

    Ok(Json(response))
}

/// Whole-image CAM overlay as JPEG.
async fn detect_with_gradcam(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let upload = read_upload(multipart).await?;
    let classifier = state.registry.classifier().await?;

    let jpeg = run_blocking(&state, move || {
        let image = preprocess::decode_image(&upload)?;
        let model = classifier.blocking_lock();
        let explanation = cam::explain(&model, &image)?;
        helpers::encode_jpeg(&explanation.overlay)
    })
    .await?;

    Ok(jpeg_response(jpeg))
}

/// Detector's native annotated output as JPEG.
async fn detect_with_boxes(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let upload = read_upload(multipart).await?;
    let detector = state.registry.detector().await?;

    let jpeg = run_blocking(&state, move || {
        let image = preprocess::decode_image(&upload)?;
        let detections = detector.blocking_lock().detect(&image)?;
        let annotated = helpers::draw_detections(&preprocess::flatten_to_rgb(&image), &detections);
        helpers::encode_jpeg(&annotated)
    })
    .await?;

    Ok(jpeg_response(jpeg))
}

/// Fused per-detection CAM overlay as JPEG; 400 when nothing was detected.
async fn detect_with_combined_heatmap(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let upload = read_upload(multipart).await?;
    let detector = state.registry.detector().await?;
    let classifier = state.registry.classifier().await?;

    let jpeg = run_blocking(&state, move || {
        let image = preprocess::decode_image(&upload)?;
        let detector = detector.blocking_lock();
        let classifier = classifier.blocking_lock();
        match fusion::explain_detections(&detector, &classifier, &image)? {
            Some(overlay) => Ok(Some(helpers::encode_jpeg(&overlay)?)),
            None => Ok(None),
        }
    })
    .await?;

    match jpeg {
        Some(jpeg) => Ok(jpeg_response(jpeg)),
        None => Err(ApiError::NoDetections),
    }
}

/// First uploaded file field of the multipart form.
async fn read_upload(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidUpload(e.to_string()))?
    {
        if field.file_name().is_some() || field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidUpload(e.to_string()))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::InvalidUpload("missing file field in multipart form".to_string()))
}

/// Runs CPU-bound inference off the async workers, bounded by the request
/// budget. An expired budget surfaces as `Timeout`; no partial body is ever
/// written.
async fn run_blocking<T, F>(state: &AppState, job: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(job);
    match tokio::time::timeout(state.request_budget, task).await {
        Err(_) => Err(ApiError::Timeout),
        Ok(Err(join)) => Err(ApiError::Internal(join.to_string())),
        Ok(Ok(result)) => result.map_err(ApiError::from),
    }
}

fn jpeg_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response()
}
