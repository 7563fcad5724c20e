/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Seconds clients should wait before retrying when we're shutting down.
const RETRY_AFTER_SECS: &str = "60";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("service unavailable")]
    Unavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QuotaExceeded => StatusCode::FORBIDDEN,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<syncstorage::Error> for ApiError {
    fn from(e: syncstorage::Error) -> Self {
        use syncstorage::Error as E;
        match e {
            E::NotFound => Self::NotFound,
            E::PayloadTooLarge(_) => Self::PayloadTooLarge,
            E::QuotaExceeded => Self::QuotaExceeded,
            E::Cancelled | E::Closed => Self::Unavailable,
            E::InvalidLimit
            | E::InvalidOffset
            | E::InvalidNewer
            | E::InvalidSort
            | E::InvalidBsoId(_)
            | E::InvalidCollectionName(_)
            | E::NothingToDo
            | E::CollectionExists => Self::BadRequest(e.to_string()),
            E::SqlError(_) | E::OpenDatabaseError(_) | E::IoError(_) | E::JsonError(_) => {
                tracing::error!(error = %e, "storage backend error");
                Self::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, self.to_string()).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert("Retry-After", RETRY_AFTER_SECS.parse().unwrap());
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        use syncstorage::Error as E;
        assert_eq!(
            ApiError::from(E::NotFound).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(E::InvalidLimit).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(E::PayloadTooLarge(1)).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(E::QuotaExceeded).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(E::Closed).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(E::Cancelled).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_unavailable_sets_retry_after() {
        let response = ApiError::Unavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "60");
    }
}
