//! Request and response interception rules.
//!
//! These are the pure halves of the interceptors; `ApiClient` applies them
//! to every call and performs the resulting session updates.

use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};

/// Response header carrying a server-rotated token. Header lookup is
/// case-insensitive.
pub const NEW_TOKEN_HEADER: &str = "x-new-token";

/// `detail` values that, on a 401, mean the held token is no longer usable
pub const INVALIDATION_DETAILS: [&str; 2] = ["Token expired", "Could not validate credentials"];

/// Add `Authorization: Bearer <token>` when a token is held. Without a
/// token the request is returned untouched.
pub fn attach_bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

/// The rotated token announced by the response, if it differs from the one
/// currently held.
pub fn rotated_token(headers: &HeaderMap, current: Option<&str>) -> Option<String> {
    let value = headers.get(NEW_TOKEN_HEADER)?.to_str().ok()?.trim();
    if value.is_empty() || Some(value) == current {
        return None;
    }
    Some(value.to_string())
}

pub fn is_session_invalidation(status: StatusCode, detail: Option<&str>) -> bool {
    status == StatusCode::UNAUTHORIZED
        && detail.is_some_and(|d| INVALIDATION_DETAILS.contains(&d))
}
