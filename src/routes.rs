use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::{
    models::{FormUpdate, UploadCandidate},
    service::{CardService, ServiceError},
    session::{SessionError, SessionView},
};

/// Camera originals may exceed the normalized cap before transcoding.
pub const UPLOAD_BODY_LIMIT: usize = 25 * 1024 * 1024;

pub fn router(service: CardService) -> Router {
    Router::new()
        .route("/api/session", get(get_session))
        .route("/api/session/form", post(update_form))
        .route("/api/session/image", post(upload_image).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)))
        .route("/api/session/generate", post(generate))
        .route("/api/session/regenerate", post(regenerate))
        .route("/api/session/dismiss-error", post(dismiss_error))
        .route("/api/session/result", get(download_result))
        .route("/api/session/share", get(share))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(service)
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Session(SessionError::Busy) => StatusCode::CONFLICT,
            ServiceError::Session(_) | ServiceError::Upload(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub async fn get_session(State(service): State<CardService>) -> Json<SessionView> {
    Json(service.snapshot())
}

pub async fn update_form(State(service): State<CardService>, Json(body): Json<FormUpdate>) -> Json<SessionView> {
    Json(service.update_form(body))
}

pub async fn upload_image(
    State(service): State<CardService>,
    mut multipart: Multipart,
) -> Result<Json<SessionView>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("could not read upload: {}", e)))?;
        info!("📤 Upload '{}' ({}, {} bytes)", file_name, content_type, bytes.len());

        let view = service.upload(UploadCandidate { bytes, content_type, file_name }).await?;
        return Ok(Json(view));
    }
    warn!("Upload request without an 'image' field");
    Err(ApiError::bad_request("missing 'image' field"))
}

pub async fn generate(State(service): State<CardService>) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(service.generate().await?))
}

pub async fn regenerate(State(service): State<CardService>) -> Json<SessionView> {
    Json(service.regenerate())
}

pub async fn dismiss_error(State(service): State<CardService>) -> Json<SessionView> {
    Json(service.dismiss_error())
}

pub async fn download_result(State(service): State<CardService>) -> Response {
    match service.download() {
        Some(card) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, card.content_type.to_string()),
                (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", card.file_name)),
            ],
            card.bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn share(State(service): State<CardService>) -> Response {
    match service.share_url() {
        Some(url) => Json(json!({ "url": url })).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
