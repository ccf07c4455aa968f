//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `Session`: in-memory token state with write generations
//! - `SessionStore`: durable storage for the token and email
//! - `crypto`: server public key import and password encryption
//!
//! The persisted token is the only thing that decides whether the user is
//! logged in. Everything else is convenience.

pub mod credentials;
pub mod crypto;
pub mod session;

pub use credentials::{FileStore, KeyringStore, MemoryStore, SessionStore, StoreError};
pub use crypto::{KeyPolicy, PublicKeyMaterial};
pub use session::{Generation, Session};
