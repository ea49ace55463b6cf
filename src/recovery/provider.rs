//! Auth provider seam.
//!
//! The resolver talks to the auth backend only through [`AuthProvider`], so
//! tests can script events and session lookups without a server.

use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::resilience::{FetchError, TimeoutError};

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: Option<u64>,
    pub user_id: Option<String>,
}

/// Auth state changes pushed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Session),
    SignedOut,
    TokenRefreshed(Session),
    /// A recovery link was consumed and produced this session.
    PasswordRecovery(Session),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("auth request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("no PKCE code verifier in storage")]
    MissingVerifier,

    #[error("malformed auth response: {0}")]
    Decode(String),

    #[error("invalid auth URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Operations the recovery resolver needs from the auth backend.
pub trait AuthProvider: Send + Sync + 'static {
    fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> impl Future<Output = AuthResult<Session>> + Send;

    /// Exchange a PKCE authorization code for a session.
    fn exchange_code_for_session(&self, code: &str) -> impl Future<Output = AuthResult<Session>> + Send;

    fn verify_recovery_token_hash(&self, token_hash: &str) -> impl Future<Output = AuthResult<Session>> + Send;

    fn verify_recovery_email_token(
        &self,
        email: &str,
        token: &str,
    ) -> impl Future<Output = AuthResult<Session>> + Send;

    /// Current session, if any. `Ok(None)` means signed out.
    fn get_session(&self) -> impl Future<Output = AuthResult<Option<Session>>> + Send;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
