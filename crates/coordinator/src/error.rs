use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody { pub code: &'static str, pub message: String }

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }
    pub fn bad_request(msg: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, "bad_request", msg) }
    pub fn unauthorized(msg: impl Into<String>) -> Self { Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg) }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, "not_found", msg) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::new(StatusCode::CONFLICT, "conflict", msg) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg) }
    pub fn service_unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", "Required dependency not ready")
    }
    pub fn bad_gateway(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, msg)
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced by the scan state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("scan for `{name}@{version}` already exists")]
    DuplicateScan { name: String, version: String },
    #[error("scan not found")]
    NotFound,
    #[error("operation not allowed while scan is {status}")]
    WrongState { status: &'static str },
    #[error("scan lease is held by another worker")]
    NotOwned,
    #[error("scan was already reported")]
    AlreadyReported,
    #[error("unknown rules: {0:?}")]
    UnknownRule(Vec<String>),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateScan { name, version } => {
                ApiError::conflict(format!("Package {name}@{version} is already queued for scanning"))
            }
            StoreError::NotFound => ApiError::not_found("scan not found"),
            StoreError::WrongState { status } => {
                ApiError::new(StatusCode::BAD_REQUEST, "wrong_state", format!("operation not allowed while scan is {status}"))
            }
            StoreError::NotOwned => {
                ApiError::new(StatusCode::BAD_REQUEST, "not_owned", "scan lease is held by another worker")
            }
            StoreError::AlreadyReported => {
                ApiError::new(StatusCode::CONFLICT, "already_reported", "scan was already reported")
            }
            StoreError::UnknownRule(names) => {
                ApiError::new(StatusCode::BAD_REQUEST, "unknown_rule", format!("unknown rules: {}", names.join(", ")))
            }
            StoreError::Db(sqlx::Error::PoolTimedOut) => ApiError::service_unavailable(),
            StoreError::Db(e) => ApiError::internal(format!("db: {e}")),
        }
    }
}
