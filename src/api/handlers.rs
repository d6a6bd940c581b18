//! Route handlers.

use super::ApiState;
use crate::error::{AuditError, ErrorCode};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// JSON error body: `{success: false, code, message}`.
#[derive(Debug)]
pub struct ApiError(pub AuditError);

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.code() {
            ErrorCode::IdentityNotFound | ErrorCode::KeyNotFound | ErrorCode::ReportNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::InvalidFieldValue => StatusCode::BAD_REQUEST,
            ErrorCode::MalformedData => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::RefreshInProgress => StatusCode::CONFLICT,
            ErrorCode::ConfigError
            | ErrorCode::StorageError
            | ErrorCode::IoError
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            success: false,
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub(super) async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub(super) async fn hierarchy(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.auditor().hierarchy_overview())
}

pub(super) async fn hierarchy_for(
    State(state): State<ApiState>,
    Path(certname): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.auditor().resolve_hierarchy(&certname)?))
}

pub(super) async fn clean(
    State(state): State<ApiState>,
    Path(certname): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.auditor().reconcile_one(&certname).await?))
}

pub(super) async fn clean_all(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.auditor().latest_estate()?))
}

pub(super) async fn clean_all_refresh(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    // The handle is dropped; the task keeps running and publishes on completion.
    state.auditor().spawn_refresh()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "message": "estate refresh started"})),
    ))
}

/// Body of `POST /v1/logging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLookupRequest {
    pub certname: String,
    pub key: String,
}

pub(super) async fn record_lookup(
    State(state): State<ApiState>,
    Json(request): Json<RecordLookupRequest>,
) -> ApiResult<impl IntoResponse> {
    let entries = state.auditor().record_lookup(&request.certname, &request.key)?;
    Ok((StatusCode::CREATED, Json(entries)))
}

pub(super) async fn all_logs(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.auditor().all_logs()?))
}

pub(super) async fn logged_keys(
    State(state): State<ApiState>,
    Path(certname): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.auditor().logged_keys(&certname)?))
}

pub(super) async fn lookup(
    State(state): State<ApiState>,
    Path((certname, key)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    match state.auditor().lookup_key(&certname, &key).await? {
        Some(found) => Ok(Json(found)),
        None => Err(AuditError::key_not_found(&certname, &key).into()),
    }
}
