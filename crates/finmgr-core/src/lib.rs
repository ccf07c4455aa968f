//! Core library for finmgr.
//!
//! Provides the authenticated API client used by every front end:
//!
//! - `api`: `ApiClient`, the session-aware HTTP client, and `ApiError`
//! - `auth`: session state, durable session storage and password encryption
//! - `config`: user configuration and environment overrides
//! - `models`: request and response bodies exchanged with the service

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiClientBuilder, ApiError};
pub use auth::{KeyPolicy, Session, SessionStore};
pub use config::Config;
