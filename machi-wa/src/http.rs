//! REST surface over the session controller.
//!
//! Every response uses the same envelope:
//!
//! ```json
//! {"success": true, "data": ...}
//! {"success": false, "error": {"code": "NOT_FOUND", "message": "..."}}
//! ```

use crate::error::SessionError;
use crate::events::{AuthArtifact, AuthMode};
use crate::recipient::pairing_phone;
use crate::session::{ArtifactStatus, SessionController};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    controller: Arc<SessionController>,
}

/// Build the router.
pub fn router(controller: Arc<SessionController>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{token}",
            get(session_status).delete(remove_session),
        )
        .route("/sessions/{token}/artifact", get(session_artifact))
        .route("/sessions/{token}/qr", get(session_artifact))
        .route("/sessions/{token}/pairing-code", post(pairing_code))
        .route("/sessions/{token}/reinitialize", post(reinitialize))
        .route("/sessions/{token}/messages/text", post(send_text))
        .route("/sessions/{token}/messages/media", post(send_media))
        .route("/sessions/{token}/logout", post(remove_session))
        .with_state(AppState { controller })
}

// ============================================================================
// Envelope
// ============================================================================

/// Error response with a stable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }
}

/// HTTP status for a session error.
#[must_use]
pub const fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::AlreadyExists(_) | SessionError::NotAuthenticated { .. } => {
            StatusCode::CONFLICT
        }
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::ArtifactTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SessionError::DeliveryFailed(_) | SessionError::StartFailed(_) => StatusCode::BAD_GATEWAY,
        SessionError::InvalidRecipientFormat(_) | SessionError::InvalidPhoneNumber(_) => {
            StatusCode::BAD_REQUEST
        }
        SessionError::TeardownFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SessionError::Media(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self {
            status: status_for(&err),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(json!({ "success": true, "data": data }))).into_response()
}

type ApiResult = Result<Response, ApiError>;

/// Artifact endpoint payload.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ArtifactBody {
    Authenticated,
    Pending,
    Ready { artifact: AuthArtifact },
}

impl From<ArtifactStatus> for ArtifactBody {
    fn from(status: ArtifactStatus) -> Self {
        match status {
            ArtifactStatus::Authenticated => Self::Authenticated,
            ArtifactStatus::Pending => Self::Pending,
            ArtifactStatus::Ready(artifact) => Self::Ready { artifact },
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    token: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

impl CreateSessionRequest {
    fn auth_mode(&self) -> Result<AuthMode, ApiError> {
        match self.mode.as_deref().map(str::trim) {
            None | Some("" | "qr") => Ok(AuthMode::Qr),
            Some("pairing_code" | "pairing-code" | "code") => {
                let phone = pairing_phone(self.phone.as_deref().unwrap_or(&self.token))?;
                Ok(AuthMode::PairingCode { phone })
            }
            Some(other) => Err(ApiError::bad_request(format!("unknown mode: {other}"))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PairingRequest {
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    to: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct SendMediaRequest {
    to: String,
    url: String,
    #[serde(default)]
    caption: Option<String>,
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Response {
    let sessions = state.controller.list().await.len();
    ok(
        StatusCode::OK,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "sessions": sessions,
        }),
    )
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    ok(StatusCode::OK, state.controller.list().await)
}

async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body?;
    let token = req.token.trim();
    if token.is_empty() {
        return Err(ApiError::bad_request("token must not be empty"));
    }
    let mode = req.auth_mode()?;
    let info = state.controller.create(token, mode).await?;
    Ok(ok(StatusCode::CREATED, info))
}

async fn session_status(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult {
    Ok(ok(StatusCode::OK, state.controller.status(&token).await?))
}

async fn session_artifact(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult {
    let status = state.controller.artifact(&token).await?;
    Ok(ok(StatusCode::OK, ArtifactBody::from(status)))
}

async fn pairing_code(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Bytes,
) -> ApiResult {
    let req: PairingRequest = optional_body(&body)?;
    let status = state
        .controller
        .request_pairing_code(&token, req.phone.as_deref())
        .await?;
    Ok(ok(StatusCode::OK, ArtifactBody::from(status)))
}

async fn reinitialize(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult {
    Ok(ok(StatusCode::OK, state.controller.reinitialize(&token).await?))
}

async fn send_text(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Result<Json<SendTextRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body?;
    let to = state.controller.send_text(&token, &req.to, &req.text).await?;
    debug!(token = %token, to = %to, "text sent");
    Ok(ok(StatusCode::OK, json!({ "to": to })))
}

async fn send_media(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Result<Json<SendMediaRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body?;
    let to = state
        .controller
        .send_media(&token, &req.to, &req.url, req.caption)
        .await?;
    debug!(token = %token, to = %to, "media sent");
    Ok(ok(StatusCode::OK, json!({ "to": to })))
}

async fn remove_session(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult {
    state.controller.remove(&token).await?;
    Ok(ok(StatusCode::OK, json!({ "token": token, "removed": true })))
}
