use tracing::{debug, warn};

use super::credentials::{SessionStore, EMAIL_KEY, TOKEN_KEY};

/// Session state version captured when an operation starts.
///
/// `epoch` moves on every logout; a login tagged with an older epoch lost
/// a race against `logout` and must be dropped. `serial` moves whenever the
/// held token changes, so a response to a request sent with an earlier
/// token cannot rotate or invalidate the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    serial: u64,
}

/// In-memory session state. Persistence is handled by the owner, which
/// writes the store under the same lock that guards this struct.
#[derive(Debug, Default)]
pub struct Session {
    token: Option<String>,
    email: Option<String>,
    in_flight: usize,
    last_error: Option<String>,
    epoch: u64,
    serial: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted token and email. Unreadable storage yields a
    /// logged-out session rather than an error.
    pub fn hydrate(store: &dyn SessionStore) -> Self {
        let read = |key: &str| match store.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(key, error = %e, "Failed to read persisted session entry");
                None
            }
        };

        let session = Self {
            token: read(TOKEN_KEY),
            email: read(EMAIL_KEY),
            ..Self::default()
        };
        debug!(authenticated = session.is_authenticated(), "Session hydrated");
        session
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// True while any login or registration is in flight
    pub fn is_loading(&self) -> bool {
        self.in_flight > 0
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn generation(&self) -> Generation {
        Generation {
            epoch: self.epoch,
            serial: self.serial,
        }
    }

    /// True when no logout happened since `issued` was captured.
    pub fn same_epoch(&self, issued: Generation) -> bool {
        issued.epoch == self.epoch
    }

    /// Mark an operation as started: loading set, previous error cleared.
    pub fn begin(&mut self) -> Generation {
        self.in_flight += 1;
        self.last_error = None;
        self.generation()
    }

    /// Mark one operation as finished.
    pub fn finish(&mut self, error: Option<String>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_error = error;
    }

    /// Adopt the token returned by a login. Returns false if a logout
    /// happened after `issued` was captured; logins started in the same
    /// epoch overwrite each other.
    pub fn commit_login(&mut self, issued: Generation, token: String, email: String) -> bool {
        if !self.same_epoch(issued) || token.is_empty() {
            return false;
        }
        self.token = Some(token);
        self.email = Some(email);
        self.serial += 1;
        true
    }

    /// Adopt a server-rotated token. Only applies while a token is held, the
    /// value differs, and the held token is still the one `issued` saw.
    pub fn rotate(&mut self, issued: Generation, token: &str) -> bool {
        if issued != self.generation() || token.is_empty() {
            return false;
        }
        match self.token.as_deref() {
            Some(current) if current != token => {
                self.token = Some(token.to_string());
                self.serial += 1;
                true
            }
            _ => false,
        }
    }

    /// Replace the stored identity after a profile change.
    pub fn set_email(&mut self, issued: Generation, email: String) -> bool {
        if !self.same_epoch(issued) || self.token.is_none() {
            return false;
        }
        self.email = Some(email);
        true
    }

    /// Drop token and email and start a new generation.
    pub fn clear(&mut self) {
        self.token = None;
        self.email = None;
        self.epoch += 1;
        self.serial += 1;
    }
}
