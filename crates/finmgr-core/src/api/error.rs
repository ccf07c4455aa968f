use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::StoreError;
use crate::models::ErrorBody;

use super::interceptor::is_session_invalidation;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{detail}")]
    Rejected { status: StatusCode, detail: String },

    #[error("Session invalidated: {0}")]
    SessionInvalidated(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Email and password are required")]
    MissingCredentials,

    #[error("Logged out while the request was in flight")]
    Superseded,

    #[error("Session storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build an error from a failed response, preferring the server's
    /// `detail` over the raw body.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.message())
            .unwrap_or_else(|| Self::truncate_body(body));

        match status.as_u16() {
            401 if is_session_invalidation(status, Some(detail.as_str())) => ApiError::SessionInvalidated(detail),
            401 => ApiError::Unauthorized(detail),
            404 => ApiError::NotFound(detail),
            429 => ApiError::RateLimited,
            400..=499 => ApiError::Rejected { status, detail },
            500..=599 => ApiError::ServerError(detail),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, detail)),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Rejected { status, .. } => Some(*status),
            ApiError::SessionInvalidated(_) | ApiError::Unauthorized(_) => Some(StatusCode::UNAUTHORIZED),
            ApiError::NotFound(_) => Some(StatusCode::NOT_FOUND),
            ApiError::RateLimited => Some(StatusCode::TOO_MANY_REQUESTS),
            ApiError::Network(e) => e.status(),
            _ => None,
        }
    }

    /// Human-readable failure reason: the server's detail when there is
    /// one, otherwise the transport-level message.
    pub fn reason(&self) -> String {
        match self {
            ApiError::Rejected { detail, .. }
            | ApiError::SessionInvalidated(detail)
            | ApiError::Unauthorized(detail)
            | ApiError::NotFound(detail)
            | ApiError::ServerError(detail) => detail.clone(),
            other => other.to_string(),
        }
    }

    /// True for server-side rejections of the submitted request, as opposed
    /// to transport or storage failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ApiError::Rejected { .. } | ApiError::Unauthorized(_) | ApiError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_preferred_over_body() {
        let err = ApiError::from_status(
            StatusCode::BAD_REQUEST,
            r#"{"detail": "Email already registered"}"#,
        );
        assert!(matches!(err, ApiError::Rejected { status, .. } if status == StatusCode::BAD_REQUEST));
        assert_eq!(err.reason(), "Email already registered");
        assert_eq!(err.to_string(), "Email already registered");
    }

    #[test]
    fn test_invalidation_details() {
        let err = ApiError::from_status(StatusCode::UNAUTHORIZED, r#"{"detail": "Token expired"}"#);
        assert!(matches!(err, ApiError::SessionInvalidated(_)));

        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"detail": "Could not validate credentials"}"#,
        );
        assert!(matches!(err, ApiError::SessionInvalidated(_)));

        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"detail": "Incorrect email or password"}"#,
        );
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert_eq!(err.reason(), "Incorrect email or password");
    }

    #[test]
    fn test_invalidation_requires_401() {
        let err = ApiError::from_status(StatusCode::FORBIDDEN, r#"{"detail": "Token expired"}"#);
        assert!(matches!(err, ApiError::Rejected { .. }));
    }

    #[test]
    fn test_non_json_body_is_truncated() {
        let body = "é".repeat(400);
        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, &body);
        match err {
            ApiError::ServerError(detail) => {
                assert!(detail.contains("truncated, 800 total bytes"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::NOT_FOUND, r#"{"detail": "Not Found"}"#),
            ApiError::NotFound(_)
        ));
        assert_eq!(ApiError::MissingCredentials.status(), None);
    }
}
