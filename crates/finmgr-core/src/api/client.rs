//! Session-aware API client for the finmgr service.
//!
//! `ApiClient` owns the session: it logs in and registers (encrypting the
//! password with the server's public key when it can), persists the token,
//! and runs every authenticated call through the request/response
//! interceptors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::credentials::{EMAIL_KEY, TOKEN_KEY};
use crate::auth::{
    FileStore, Generation, KeyPolicy, KeyringStore, PublicKeyMaterial, Session, SessionStore,
};
use crate::config::{Config, StorageBackend};
use crate::models::{
    ChangePasswordRequest, LoginRequest, LoginResponse, PasswordField, ProfileUpdate,
    PubkeyResponse, RegisterRequest, UserProfile,
};

use super::interceptor;
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const PUBKEY_PATH: &str = "/auth/pubkey";
const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const ME_PATH: &str = "/auth/me";
const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";
const UPDATE_PROFILE_PATH: &str = "/auth/update-profile";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// State shared by every clone of a client.
struct Shared {
    session: RwLock<Session>,
    pubkey: RwLock<Option<PublicKeyMaterial>>,
    store: Arc<dyn SessionStore>,
}

/// Ciphertexts produced with a single public key.
struct Encrypted {
    values: Vec<String>,
    from_cache: bool,
}

/// API client for the finmgr service.
/// Clone is cheap: clones share the session, the key cache and the
/// connection pool.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    encrypt_passwords: bool,
    key_policy: KeyPolicy,
    pubkey_max_age_secs: u64,
    rate_limit_backoff_ms: u64,
    shared: Arc<Shared>,
}

/// One-time construction step for `ApiClient`.
pub struct ApiClientBuilder {
    config: Config,
    store: Option<Arc<dyn SessionStore>>,
    rate_limit_backoff_ms: u64,
}

impl ApiClientBuilder {
    /// Persist the session in `store` instead of the configured back end.
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Initial delay before retrying a rate-limited request.
    pub fn rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Build the client and hydrate the session from storage.
    pub fn build(self) -> anyhow::Result<ApiClient> {
        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => match self.config.storage {
                StorageBackend::File => Arc::new(FileStore::new(self.config.data_dir()?)),
                StorageBackend::Keyring => Arc::new(KeyringStore),
            },
        };
        let session = Session::hydrate(store.as_ref());

        Ok(ApiClient {
            client,
            base_url: self.config.base_url().to_string(),
            encrypt_passwords: self.config.encrypt_passwords,
            key_policy: self.config.key_policy,
            pubkey_max_age_secs: self.config.pubkey_max_age_secs,
            rate_limit_backoff_ms: self.rate_limit_backoff_ms,
            shared: Arc::new(Shared {
                session: RwLock::new(session),
                pubkey: RwLock::new(None),
                store,
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: &Config) -> ApiClientBuilder {
        ApiClientBuilder {
            config: config.clone(),
            store: None,
            rate_limit_backoff_ms: INITIAL_BACKOFF_MS,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ===== Session State =====

    pub async fn is_authenticated(&self) -> bool {
        self.shared.session.read().await.is_authenticated()
    }

    pub async fn token(&self) -> Option<String> {
        self.shared.session.read().await.token().map(str::to_string)
    }

    pub async fn email(&self) -> Option<String> {
        self.shared.session.read().await.email().map(str::to_string)
    }

    pub async fn is_loading(&self) -> bool {
        self.shared.session.read().await.is_loading()
    }

    /// Reason for the last failed login or registration
    pub async fn last_error(&self) -> Option<String> {
        self.shared.session.read().await.last_error().map(str::to_string)
    }

    pub async fn generation(&self) -> Generation {
        self.shared.session.read().await.generation()
    }

    // ===== Interceptors =====

    /// Add the bearer token to `request` when one is held.
    pub async fn attach(&self, request: RequestBuilder) -> RequestBuilder {
        let session = self.shared.session.read().await;
        interceptor::attach_bearer(request, session.token())
    }

    /// Apply the response rules to a response for a request issued under
    /// `issued`: adopt a rotated token, and log out when a 401 reports the
    /// session as invalid. Failed responses are returned as errors.
    pub async fn observe_response(
        &self,
        response: Response,
        issued: Generation,
    ) -> Result<Response, ApiError> {
        let issued = self.adopt_rotated_token(&response, issued).await;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let err = ApiError::from_status(status, &body);
        if let ApiError::SessionInvalidated(ref detail) = err {
            let mut session = self.shared.session.write().await;
            if session.generation() == issued {
                warn!(detail = %detail, "Server invalidated the session, logging out");
                self.clear_session(&mut session);
            } else {
                debug!(detail = %detail, "Ignoring invalidation of an earlier token");
            }
        }
        Err(err)
    }

    /// Returns the generation the rest of the response handling runs
    /// under: moved forward when the rotated token was adopted.
    async fn adopt_rotated_token(&self, response: &Response, issued: Generation) -> Generation {
        let mut session = self.shared.session.write().await;
        let Some(token) = interceptor::rotated_token(response.headers(), session.token()) else {
            return issued;
        };
        if session.generation() != issued || !session.is_authenticated() {
            debug!("Ignoring rotated token for a stale request");
            return issued;
        }
        if let Err(e) = self.shared.store.set(TOKEN_KEY, &token) {
            warn!(error = %e, "Failed to persist rotated token");
            return issued;
        }
        if session.rotate(issued, &token) {
            debug!("Adopted rotated token");
            return session.generation();
        }
        issued
    }

    /// Send `request` through both interceptors.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let (request, issued) = {
            let session = self.shared.session.read().await;
            (
                interceptor::attach_bearer(request, session.token()),
                session.generation(),
            )
        };
        let response = request.send().await?;
        self.observe_response(response, issued).await
    }

    /// Send, retrying rate-limited requests with exponential backoff.
    async fn execute<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = self.rate_limit_backoff_ms;

        loop {
            match self.send(build()).await {
                Err(ApiError::RateLimited) => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
                other => return other,
            }
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse {}: {}", what, e)))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.execute(|| self.client.get(&url)).await?;
        Self::parse_json(response, path).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.execute(|| self.client.post(&url).json(body)).await?;
        Self::parse_json(response, path).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.execute(|| self.client.put(&url).json(body)).await?;
        Self::parse_json(response, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let url = self.url(path);
        self.execute(|| self.client.delete(&url)).await?;
        Ok(())
    }

    /// Check if response is successful, returning an error with body if not.
    /// Used for the unauthenticated auth endpoints.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Public Key =====

    /// The server public key. A cached key is returned unless
    /// `force_refresh` is set or it has aged out; fetched keys are cached
    /// only under `KeyPolicy::Cached`.
    pub async fn public_key(&self, force_refresh: bool) -> Result<PublicKeyMaterial, ApiError> {
        self.resolve_key(force_refresh).await.map(|(key, _)| key)
    }

    async fn resolve_key(&self, force_refresh: bool) -> Result<(PublicKeyMaterial, bool), ApiError> {
        if !force_refresh {
            if let Some(ref key) = *self.shared.pubkey.read().await {
                if !key.is_stale(self.pubkey_max_age_secs) {
                    return Ok((key.clone(), true));
                }
            }
        }

        let response = self.client.get(self.url(PUBKEY_PATH)).send().await?;
        let response = Self::check_response(response).await?;
        let body: PubkeyResponse = Self::parse_json(response, PUBKEY_PATH).await?;
        let key = PublicKeyMaterial::new(body.pem, body.alg);
        debug!(alg = ?key.alg, "Fetched server public key");

        if self.key_policy == KeyPolicy::Cached {
            *self.shared.pubkey.write().await = Some(key.clone());
        }
        Ok((key, false))
    }

    async fn drop_cached_key(&self) {
        if self.shared.pubkey.write().await.take().is_some() {
            debug!("Dropped cached public key after rejection");
        }
    }

    /// Encrypt every secret with one public key. `None` means encryption is
    /// unavailable and the caller sends plaintext; failures never escape.
    async fn encrypt_secrets(&self, secrets: &[&str]) -> Option<Encrypted> {
        if !self.encrypt_passwords {
            return None;
        }

        let force_refresh = self.key_policy == KeyPolicy::Refresh;
        let (key, from_cache) = match self.resolve_key(force_refresh).await {
            Ok(found) => found,
            Err(e) => {
                debug!(error = %e, "Public key unavailable, submitting plaintext");
                return None;
            }
        };

        match secrets.iter().map(|s| key.encrypt(s)).collect::<Result<Vec<_>, _>>() {
            Ok(values) => Some(Encrypted { values, from_cache }),
            Err(e) => {
                warn!(error = %e, "Password encryption failed, submitting plaintext");
                None
            }
        }
    }

    /// Base64 ciphertext of `secret`, or `None` when plaintext must be sent.
    pub async fn encrypted_secret(&self, secret: &str) -> Option<String> {
        self.encrypt_secrets(&[secret])
            .await
            .and_then(|e| e.values.into_iter().next())
    }

    async fn password_field(&self, password: &str) -> (PasswordField, bool) {
        match self.encrypt_secrets(&[password]).await {
            Some(Encrypted { mut values, from_cache }) => {
                (PasswordField::EncPassword(values.remove(0)), from_cache)
            }
            None => (PasswordField::Password(password.to_string()), false),
        }
    }

    // ===== Login / Registration =====

    /// Log in and persist the returned token.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let issued = self.shared.session.write().await.begin();
        let result = self.login_inner(email, password, issued).await;
        self.finish(&result).await;
        result
    }

    /// Create an account, then log in with the same credentials.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        company_name: Option<&str>,
    ) -> Result<(), ApiError> {
        let issued = self.shared.session.write().await.begin();
        let result = self.register_inner(email, password, company_name, issued).await;
        self.finish(&result).await;
        result
    }

    async fn finish(&self, result: &Result<(), ApiError>) {
        let error = result.as_ref().err().map(ApiError::reason);
        if let Some(ref reason) = error {
            debug!(reason = %reason, "Authentication failed");
        }
        self.shared.session.write().await.finish(error);
    }

    fn validate(email: &str, password: &str) -> Result<(), ApiError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ApiError::MissingCredentials);
        }
        Ok(())
    }

    async fn login_inner(&self, email: &str, password: &str, issued: Generation) -> Result<(), ApiError> {
        Self::validate(email, password)?;

        let (password_field, from_cache) = self.password_field(password).await;
        let body = LoginRequest {
            email: email.to_string(),
            password: password_field,
        };
        debug!(email, encrypted = body.password.is_encrypted(), "Submitting login");

        let response = self.client.post(self.url(LOGIN_PATH)).json(&body).send().await?;
        self.adopt_rotated_token(&response, issued).await;
        let response = match Self::check_response(response).await {
            Ok(response) => response,
            Err(e) => {
                if from_cache && e.is_rejection() {
                    self.drop_cached_key().await;
                }
                return Err(e);
            }
        };

        let auth: LoginResponse = Self::parse_json(response, "login response").await?;
        self.commit_login(issued, auth.access_token, email).await
    }

    async fn register_inner(
        &self,
        email: &str,
        password: &str,
        company_name: Option<&str>,
        issued: Generation,
    ) -> Result<(), ApiError> {
        Self::validate(email, password)?;

        let (password_field, from_cache) = self.password_field(password).await;
        let body = RegisterRequest {
            email: email.to_string(),
            password: password_field,
            company_name: company_name.map(str::to_string),
        };
        debug!(email, encrypted = body.password.is_encrypted(), "Submitting registration");

        let response = self.client.post(self.url(REGISTER_PATH)).json(&body).send().await?;
        self.adopt_rotated_token(&response, issued).await;
        if let Err(e) = Self::check_response(response).await {
            if from_cache && e.is_rejection() {
                self.drop_cached_key().await;
            }
            return Err(e);
        }
        info!(email, "Registered");

        self.login_inner(email, password, issued).await
    }

    /// Persist then adopt a login token, unless a logout happened since
    /// `issued`.
    async fn commit_login(&self, issued: Generation, token: String, email: &str) -> Result<(), ApiError> {
        if token.is_empty() {
            return Err(ApiError::InvalidResponse("Empty access token".to_string()));
        }

        let mut session = self.shared.session.write().await;
        if !session.same_epoch(issued) {
            warn!(email, "Logged out during login, discarding token");
            return Err(ApiError::Superseded);
        }

        self.shared
            .store
            .set_entries(&[(TOKEN_KEY, token.as_str()), (EMAIL_KEY, email)])?;
        session.commit_login(issued, token, email.to_string());
        info!(email, "Logged in");
        Ok(())
    }

    /// Clear the session in memory and in storage. Safe to call when
    /// already logged out.
    pub async fn logout(&self) {
        let mut session = self.shared.session.write().await;
        self.clear_session(&mut session);
    }

    /// Clear with the session lock already held.
    fn clear_session(&self, session: &mut Session) {
        session.clear();
        for key in [TOKEN_KEY, EMAIL_KEY] {
            if let Err(e) = self.shared.store.remove(key) {
                warn!(key, error = %e, "Failed to remove persisted session entry");
            }
        }
        info!("Logged out");
    }

    // ===== Account Methods =====

    /// Fetch the authenticated user's profile
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        self.get_json(ME_PATH).await
    }

    /// Change the password, encrypting both values with one key when possible
    pub async fn change_password(&self, current: &str, new: &str) -> Result<(), ApiError> {
        if current.is_empty() || new.is_empty() {
            return Err(ApiError::MissingCredentials);
        }

        let body = match self.encrypt_secrets(&[current, new]).await {
            Some(Encrypted { values, .. }) => {
                let mut values = values.into_iter();
                match (values.next(), values.next()) {
                    (Some(enc_current_password), Some(enc_new_password)) => {
                        ChangePasswordRequest::Encrypted {
                            enc_current_password,
                            enc_new_password,
                        }
                    }
                    _ => ChangePasswordRequest::Plain {
                        current_password: current.to_string(),
                        new_password: new.to_string(),
                    },
                }
            }
            None => ChangePasswordRequest::Plain {
                current_password: current.to_string(),
                new_password: new.to_string(),
            },
        };

        let _: serde_json::Value = self.post_json(CHANGE_PASSWORD_PATH, &body).await?;
        info!("Password changed");
        Ok(())
    }

    /// Update email and/or company name. A changed email replaces the
    /// stored identity.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<(), ApiError> {
        if update.is_empty() {
            return Ok(());
        }

        let issued = self.generation().await;
        let _: serde_json::Value = self.put_json(UPDATE_PROFILE_PATH, update).await?;

        if let Some(ref email) = update.email {
            let mut session = self.shared.session.write().await;
            if session.same_epoch(issued) && session.is_authenticated() {
                self.shared.store.set(EMAIL_KEY, email)?;
                session.set_email(issued, email.clone());
            }
        }
        Ok(())
    }
}
