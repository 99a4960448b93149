//! Request-level error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ft_core::{DigestError, PathError, VersionError};
use ft_db::DbError;
use ft_store::StoreError;
use tracing::error;

/// Everything a handler can fail with, shaped for the wire. Stale-version
/// outcomes are not errors and never pass through here.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("upstream fallback failed: {0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found\n").into_response(),
            ApiError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, format!("{reason}\n")).into_response()
            }
            ApiError::Upstream(reason) => {
                error!("fallback origin failure: {reason}");
                (StatusCode::BAD_GATEWAY, "upstream failure\n").into_response()
            }
            ApiError::Internal(err) => {
                // The cause is for the log, not the client.
                error!("internal error: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error\n").into_response()
            }
        }
    }
}

impl From<PathError> for ApiError {
    fn from(err: PathError) -> Self {
        ApiError::BadRequest(format!("invalid path: {err}"))
    }
}

impl From<VersionError> for ApiError {
    fn from(err: VersionError) -> Self {
        ApiError::BadRequest(format!("invalid last_modified: {err}"))
    }
}

impl From<DigestError> for ApiError {
    fn from(err: DigestError) -> Self {
        ApiError::BadRequest(format!("invalid checksum: {err}"))
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        // A missing blob behind a live link is an invariant violation,
        // not a client-visible 404.
        ApiError::Internal(err.into())
    }
}
