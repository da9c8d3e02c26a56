use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};

/// Domain errors raised by the engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or incomplete organization configuration. Never retryable.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("illegal {axis} transition {from} -> {to}")]
    InvalidTransition { axis: &'static str, from: &'static str, to: &'static str },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("object store {op} failed: {message}")]
    ObjectStore { op: &'static str, message: String },
    #[error("cluster credential error: {0}")]
    Credential(String),
    #[error("cluster {op} failed: {source}")]
    Cluster { op: &'static str, #[source] source: kube::Error },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    /// The version row is committed but no upload URL could be issued.
    /// Recover with `BentoVersionService::issue_upload_url`.
    #[error("bento version {version_id} registered but upload url issuance failed: {source}")]
    UploadUrlIssuance { version_id: i64, #[source] source: Box<Error> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self { Self::NotFound { kind, key: key.to_string() } }
    pub fn config(msg: impl Into<String>) -> Self { Self::Config(msg.into()) }
    pub fn object_store(op: &'static str, err: impl Display) -> Self { Self::ObjectStore { op, message: err.to_string() } }

    /// Wrap a kube error, folding HTTP 409 into `AlreadyExists`.
    pub fn cluster(op: &'static str, kind: &'static str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::AlreadyExists { kind, name: name.to_string() },
            source => Self::Cluster { op, source },
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists { .. }) }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(db.message().to_string()),
            other => Self::Database(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String, pub version_id: Option<i64> }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), version_id: None }
    }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, "not_found", msg) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::new(StatusCode::CONFLICT, "conflict", msg) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg) }
    pub fn bad_request(msg: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, "bad_request", msg) }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let message = e.to_string();
        match e {
            Error::Config(_) => Self::new(StatusCode::PRECONDITION_FAILED, "configuration", message),
            Error::NotFound { .. } => Self::not_found(message),
            Error::Conflict(_) | Error::AlreadyExists { .. } => Self::conflict(message),
            Error::InvalidTransition { .. } => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition", message),
            Error::Database(_) => Self::internal(message),
            Error::ObjectStore { .. } => Self::new(StatusCode::BAD_GATEWAY, "object_store", message),
            Error::Credential(_) | Error::Cluster { .. } => Self::new(StatusCode::BAD_GATEWAY, "cluster", message),
            Error::UploadUrlIssuance { version_id, .. } => {
                let mut err = Self::new(StatusCode::BAD_GATEWAY, "upload_url_issuance", message);
                err.version_id = Some(version_id);
                err
            }
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message, version_id: self.version_id };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
