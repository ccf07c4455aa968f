#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use finmgr_core::auth::{KeyPolicy, MemoryStore, SessionStore};
use finmgr_core::{ApiClient, Config};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Scriptable state behind the mock auth server.
#[derive(Default)]
pub struct MockState {
    pub private_key: Option<RsaPrivateKey>,
    pub pem: Option<String>,
    pub alg: Option<String>,
    pub pubkey_fetches: usize,
    /// email -> plaintext password
    pub users: HashMap<String, String>,
    /// Token handed out by `/auth/login`
    pub issue_token: String,
    pub valid_tokens: HashSet<String>,
    pub expired_tokens: HashSet<String>,
    pub login_bodies: Vec<Value>,
    pub register_bodies: Vec<Value>,
    pub change_password_bodies: Vec<Value>,
    pub profile_bodies: Vec<Value>,
    /// Authorization headers seen by authenticated routes
    pub seen_auth: Vec<Option<String>>,
    /// Sent as `X-New-Token` on `/auth/me`
    pub rotate_to: Option<String>,
    /// Sent as `X-New-Token` on `/auth/register`, success or failure
    pub register_rotate_to: Option<String>,
    /// Forced failure for `/auth/me`
    pub me_failure: Option<(StatusCode, String)>,
    pub rate_limit_remaining: usize,
    pub login_delay_ms: u64,
}

impl MockState {
    pub fn new(token: &str) -> Self {
        Self {
            issue_token: token.to_string(),
            valid_tokens: HashSet::from([token.to_string()]),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, email: &str, password: &str) -> Self {
        self.users.insert(email.to_string(), password.to_string());
        self
    }

    /// Serve a fresh RSA key pair from `/auth/pubkey`
    pub fn with_keypair(mut self, alg: Option<&str>) -> Self {
        self.rotate_keypair();
        self.alg = alg.map(str::to_string);
        self
    }

    pub fn rotate_keypair(&mut self) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("failed to generate key");
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("failed to encode key");
        self.private_key = Some(private);
        self.pem = Some(pem);
    }

    fn decrypt(&self, encoded: &str) -> Option<String> {
        let key = self.private_key.as_ref()?;
        let ciphertext = STANDARD.decode(encoded).ok()?;
        let plain = match self.alg.as_deref() {
            Some("RSA-PKCS1v15") => key.decrypt(Pkcs1v15Encrypt, &ciphertext).ok()?,
            _ => key.decrypt(Oaep::new::<Sha256>(), &ciphertext).ok()?,
        };
        String::from_utf8(plain).ok()
    }

    fn password_from(&self, body: &Value, field: &str) -> Option<String> {
        match body.get(format!("enc_{}", field)).and_then(Value::as_str) {
            Some(encoded) => self.decrypt(encoded),
            None => body.get(field).and_then(Value::as_str).map(str::to_string),
        }
    }
}

type Shared = Arc<Mutex<MockState>>;

fn detail(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Checks the bearer token like the real service does.
fn authorize(state: &mut MockState, headers: &HeaderMap) -> Result<(), Response> {
    let token = bearer(headers);
    state.seen_auth.push(token.clone());
    match token {
        None => Err(detail(StatusCode::UNAUTHORIZED, "Not authenticated")),
        Some(t) if state.expired_tokens.contains(&t) => {
            Err(detail(StatusCode::UNAUTHORIZED, "Token expired"))
        }
        Some(t) if !state.valid_tokens.contains(&t) => Err(detail(
            StatusCode::UNAUTHORIZED,
            "Could not validate credentials",
        )),
        Some(_) => Ok(()),
    }
}

async fn handle_pubkey(State(state): State<Shared>) -> Response {
    let mut state = state.lock().unwrap();
    state.pubkey_fetches += 1;
    match state.pem.clone() {
        Some(pem) => Json(json!({ "alg": state.alg, "pem": pem })).into_response(),
        None => detail(StatusCode::SERVICE_UNAVAILABLE, "Key service unavailable"),
    }
}

async fn handle_login(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let delay = {
        let mut state = state.lock().unwrap();
        state.login_bodies.push(body.clone());
        state.login_delay_ms
    };
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let state = state.lock().unwrap();
    let email = body.get("email").and_then(Value::as_str).unwrap_or_default();
    let password = state.password_from(&body, "password");
    match (state.users.get(email), password) {
        (Some(expected), Some(given)) if *expected == given => {
            Json(json!({ "access_token": state.issue_token, "token_type": "bearer" })).into_response()
        }
        _ => detail(StatusCode::UNAUTHORIZED, "Incorrect email or password"),
    }
}

async fn handle_register(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    let response = register(&mut state, body);
    match state.register_rotate_to.clone() {
        Some(token) => ([("X-New-Token", token)], response).into_response(),
        None => response,
    }
}

fn register(state: &mut MockState, body: Value) -> Response {
    state.register_bodies.push(body.clone());
    let email = body.get("email").and_then(Value::as_str).unwrap_or_default().to_string();
    if state.users.contains_key(&email) {
        return detail(StatusCode::BAD_REQUEST, "Email already registered");
    }
    let Some(password) = state.password_from(&body, "password") else {
        return detail(StatusCode::BAD_REQUEST, "Invalid encrypted password");
    };
    state.users.insert(email.clone(), password);
    Json(json!({
        "email": email,
        "id": state.users.len(),
        "is_active": true,
        "created_at": "2024-05-01T10:00:00",
        "company_id": null
    }))
    .into_response()
}

async fn handle_me(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }
    if state.rate_limit_remaining > 0 {
        state.rate_limit_remaining -= 1;
        return detail(StatusCode::TOO_MANY_REQUESTS, "Slow down");
    }
    if let Some((status, message)) = state.me_failure.clone() {
        return detail(status, &message);
    }

    let body = Json(json!({
        "email": "a@b.com",
        "id": 1,
        "is_active": true,
        "created_at": "2024-05-01T10:00:00",
        "company_id": 4
    }));
    match state.rotate_to.clone() {
        Some(token) => {
            state.valid_tokens.insert(token.clone());
            ([("X-New-Token", token)], body).into_response()
        }
        None => body.into_response(),
    }
}

async fn handle_change_password(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }
    state.change_password_bodies.push(body);
    Json(json!({ "ok": true })).into_response()
}

async fn handle_update_profile(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }
    state.profile_bodies.push(body);
    Json(json!({ "ok": true })).into_response()
}

/// In-process stand-in for the finmgr auth endpoints.
pub struct MockAuthServer {
    state: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl MockAuthServer {
    pub async fn start(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let port = listener.local_addr().expect("no local addr").port();
        let state = Arc::new(Mutex::new(state));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let app = Router::new()
            .route("/auth/pubkey", get(handle_pubkey))
            .route("/auth/login", post(handle_login))
            .route("/auth/register", post(handle_register))
            .route("/auth/me", get(handle_me))
            .route("/auth/change-password", post(handle_change_password))
            .route("/auth/update-profile", put(handle_update_profile))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            state,
            shutdown_tx: Some(shutdown_tx),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockAuthServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A client talking to `server`, persisting into a fresh memory store.
pub fn client_for(server: &MockAuthServer, key_policy: KeyPolicy) -> (ApiClient, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let client = client_with_store(server, key_policy, store.clone());
    (client, store)
}

/// A client talking to `server`, persisting into `store`.
pub fn client_with_store(
    server: &MockAuthServer,
    key_policy: KeyPolicy,
    store: Arc<dyn SessionStore>,
) -> ApiClient {
    let config = Config {
        api_base: server.url(),
        key_policy,
        request_timeout_secs: 5,
        ..Config::default()
    };
    ApiClient::builder(&config)
        .store(store)
        .rate_limit_backoff(Duration::from_millis(10))
        .build()
        .expect("failed to build client")
}
