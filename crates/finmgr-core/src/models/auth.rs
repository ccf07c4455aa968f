use serde::{Deserialize, Serialize};

/// The password as it goes on the wire: either in the clear or as base64
/// RSA ciphertext. Serializes as a single `password` or `enc_password` field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordField {
    Password(String),
    EncPassword(String),
}

impl PasswordField {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, PasswordField::EncPassword(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    #[serde(flatten)]
    pub password: PasswordField,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    #[serde(flatten)]
    pub password: PasswordField,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

/// Both passwords are encrypted with the same key, or neither is.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChangePasswordRequest {
    Plain {
        current_password: String,
        new_password: String,
    },
    Encrypted {
        enc_current_password: String,
        enc_new_password: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PubkeyResponse {
    pub pem: String,
    #[serde(default)]
    pub alg: Option<String>,
}

/// Structured error body returned on failures.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl ErrorBody {
    /// Human-readable detail. Validation errors arrive as lists and are
    /// rendered as compact JSON.
    pub fn message(&self) -> Option<String> {
        match self.detail.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
