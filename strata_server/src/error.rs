use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use strata_core::Error as CoreError;

/// Stable wire envelope for every error response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing x-api-key header")]
    MissingApiKey,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("this operation requires a secret key")]
    SecretKeyRequired,

    #[error("session authentication required")]
    SessionRequired,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Core(#[from] CoreError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingApiKey | ApiError::InvalidApiKey | ApiError::SessionRequired => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::SecretKeyRequired => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err {
                CoreError::BadRequest(_) | CoreError::Schema(_) | CoreError::Denied(_) => {
                    StatusCode::BAD_REQUEST
                }
                CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::Conflict(_) => StatusCode::CONFLICT,
                CoreError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
                CoreError::Crypto(_)
                | CoreError::Timeout(_)
                | CoreError::ObjectStore { .. }
                | CoreError::Backend { .. }
                | CoreError::BackendMessage(_)
                | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::MissingApiKey | ApiError::InvalidApiKey | ApiError::SessionRequired => {
                "UNAUTHORIZED"
            }
            ApiError::SecretKeyRequired => "FORBIDDEN",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Core(err) => err.code(),
        }
    }

    /// Server-side failures keep their detail out of the response body.
    fn public_message(&self) -> String {
        match self {
            ApiError::Core(err) => match err {
                CoreError::Crypto(_)
                | CoreError::Backend { .. }
                | CoreError::BackendMessage(_)
                | CoreError::ObjectStore { .. }
                | CoreError::Internal(_) => "internal error".to_string(),
                other => other.to_string(),
            },
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.public_message(),
            status_code: status.as_u16(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_kinds_map_onto_stable_codes() {
        let cases = [
            (CoreError::BadRequest("x".into()), 400, "BAD_REQUEST"),
            (CoreError::Schema("x".into()), 400, "BAD_REQUEST"),
            (CoreError::Denied("x".into()), 400, "BAD_REQUEST"),
            (CoreError::Unauthorized("x".into()), 401, "UNAUTHORIZED"),
            (CoreError::Forbidden("x".into()), 403, "FORBIDDEN"),
            (CoreError::NotFound("x".into()), 404, "NOT_FOUND"),
            (CoreError::Conflict("x".into()), 409, "CONFLICT"),
            (CoreError::TooManyRequests("x".into()), 429, "TOO_MANY_REQUESTS"),
            (CoreError::Internal("x".into()), 500, "INTERNAL_ERROR"),
        ];
        for (err, status, code) in cases {
            let api = ApiError::Core(err);
            assert_eq!(api.status_code().as_u16(), status);
            assert_eq!(api.code(), code);
        }
    }

    #[test]
    fn server_errors_do_not_echo_detail() {
        let api = ApiError::Core(CoreError::BackendMessage(
            "connection to 10.0.0.3 refused".into(),
        ));
        assert_eq!(api.public_message(), "internal error");

        let api = ApiError::Core(CoreError::BadRequest("limit must be >= 1".into()));
        assert!(api.public_message().contains("limit"));
    }

    #[test]
    fn secret_tier_violation_is_forbidden() {
        let api = ApiError::SecretKeyRequired;
        assert_eq!(api.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(api.code(), "FORBIDDEN");
    }
}
