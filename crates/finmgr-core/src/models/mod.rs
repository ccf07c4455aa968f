//! Wire types for the finmgr service.
//!
//! - `auth`: login, registration and profile bodies
//! - `user`: the authenticated user's profile

pub mod auth;
pub mod user;

pub use auth::{
    ChangePasswordRequest, ErrorBody, LoginRequest, LoginResponse, PasswordField, PubkeyResponse,
    RegisterRequest,
};
pub use user::{ProfileUpdate, UserProfile};
