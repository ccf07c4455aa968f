//! REST API client module for the finmgr service.
//!
//! This module provides the `ApiClient`, which owns the user session and
//! mediates every call that needs authentication: it attaches the bearer
//! token, adopts tokens rotated by the server, and logs out when the server
//! reports the token as expired or invalid.

pub mod client;
pub mod error;
pub mod interceptor;

pub use client::{ApiClient, ApiClientBuilder};
pub use error::ApiError;
