//! Client-side password encryption with the server's RSA public key.
//!
//! The server publishes its key at `/auth/pubkey`. Encryption is a hardening
//! step only; callers treat every error here as "send plaintext".

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// How the client obtains the public key for each login or registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    /// Reuse a previously fetched key until it exceeds the configured age
    Cached,
    /// Fetch a fresh key for every operation
    #[default]
    Refresh,
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Malformed public key: {0}")]
    MalformedKey(String),

    #[error("Unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Encryption failed: {0}")]
    Encryption(#[from] rsa::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Padding {
    OaepSha256,
    Pkcs1v15,
}

impl Padding {
    fn from_alg(alg: Option<&str>) -> Result<Self, CryptoError> {
        match alg {
            None | Some("RSA-OAEP") | Some("RSA-OAEP-256") => Ok(Padding::OaepSha256),
            Some("RSA-PKCS1v15") | Some("RSA1_5") => Ok(Padding::Pkcs1v15),
            Some(other) => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A server-issued public key as fetched from `/auth/pubkey`.
#[derive(Debug, Clone)]
pub struct PublicKeyMaterial {
    pub pem: String,
    /// Algorithm advertised by the server; OAEP/SHA-256 when absent
    pub alg: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PublicKeyMaterial {
    pub fn new(pem: String, alg: Option<String>) -> Self {
        Self {
            pem,
            alg,
            fetched_at: Utc::now(),
        }
    }

    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.fetched_at).num_seconds()
    }

    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        self.age_secs() > max_age_secs as i64
    }

    /// Encrypt the UTF-8 bytes of `secret` and return standard base64.
    pub fn encrypt(&self, secret: &str) -> Result<String, CryptoError> {
        let padding = Padding::from_alg(self.alg.as_deref())?;
        let key = import_key(&self.pem)?;
        let mut rng = rand::thread_rng();

        let ciphertext = match padding {
            Padding::OaepSha256 => key.encrypt(&mut rng, Oaep::new::<Sha256>(), secret.as_bytes())?,
            Padding::Pkcs1v15 => key.encrypt(&mut rng, Pkcs1v15Encrypt, secret.as_bytes())?,
        };
        Ok(STANDARD.encode(ciphertext))
    }
}

/// Accepts SubjectPublicKeyInfo (`BEGIN PUBLIC KEY`) and PKCS#1
/// (`BEGIN RSA PUBLIC KEY`) PEM.
fn import_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))
}
