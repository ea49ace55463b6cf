//! Auth provider backed by the hosted auth REST API.
//!
//! # Responsibilities
//! - Turn recovery link material into a session (`/auth/v1/token`, `/auth/v1/verify`)
//! - Validate handed-over tokens against `/auth/v1/user`
//! - Keep the current session in memory and broadcast auth events
//!
//! # Design Decisions
//! - Every call goes through the `GuardedClient`, so auth outages feed the breaker
//! - Auth calls are bounded by the request timeout; a timeout leaves the breaker alone
//! - The PKCE verifier is read from the durable store and removed once used
//! - A verifier saved for a password-recovery redirect emits `PasswordRecovery`

use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::cache::KeyValueStore;
use crate::recovery::provider::{AuthError, AuthEvent, AuthProvider, AuthResult, Session};
use crate::resilience::{with_timeout, FetchError, GuardedClient};

const EVENT_CAPACITY: usize = 16;
const RECOVERY_REDIRECT: &str = "PASSWORD_RECOVERY";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_at: Option<u64>,
    user: Option<UserResponse>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

impl ErrorResponse {
    fn into_message(self) -> Option<String> {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
    }
}

impl From<TokenResponse> for Session {
    fn from(token: TokenResponse) -> Self {
        Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_at,
            user_id: token.user.map(|u| u.id),
        }
    }
}

pub struct HttpAuthProvider {
    client: GuardedClient,
    anon_key: String,
    timeout: Duration,
    store: Arc<dyn KeyValueStore>,
    verifier_key: String,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpAuthProvider {
    pub fn new(
        client: GuardedClient,
        anon_key: impl Into<String>,
        timeout: Duration,
        store: Arc<dyn KeyValueStore>,
        verifier_key: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client,
            anon_key: anon_key.into(),
            timeout,
            store,
            verifier_key: verifier_key.into(),
            session: Mutex::new(None),
            events,
        }
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn builder(&self, method: Method, path: &str) -> AuthResult<RequestBuilder> {
        let url = self.client.backend_url(path)?;
        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.anon_key))
    }

    async fn send(&self, builder: RequestBuilder) -> AuthResult<Response> {
        let request = builder.build().map_err(FetchError::Network)?;
        let response = with_timeout("auth request", self.timeout, self.client.execute(request)).await??;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .ok()
            .and_then(ErrorResponse::into_message)
            .unwrap_or(body);
        Err(AuthError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn token_request(&self, builder: RequestBuilder) -> AuthResult<Session> {
        let response = self.send(builder).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))?;
        Ok(token.into())
    }

    /// Store the session and tell subscribers about it.
    fn establish(&self, session: Session, recovery: bool) -> Session {
        *self.session_slot() = Some(session.clone());
        let event = if recovery {
            AuthEvent::PasswordRecovery(session.clone())
        } else {
            AuthEvent::SignedIn(session.clone())
        };
        tracing::info!(
            user_id = session.user_id.as_deref().unwrap_or("unknown"),
            recovery,
            "Auth session established"
        );
        // no receivers is fine
        let _ = self.events.send(event);
        session
    }

    /// Read the stored verifier. Values look like `"<verifier>/<redirect type>"`,
    /// optionally JSON-quoted.
    fn take_verifier(&self) -> AuthResult<(String, bool)> {
        let raw = match self.store.get_item(&self.verifier_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(AuthError::MissingVerifier),
            Err(e) => {
                tracing::debug!(error = %e, "Code verifier lookup failed");
                return Err(AuthError::MissingVerifier);
            }
        };
        let raw = serde_json::from_str::<String>(&raw).unwrap_or(raw);
        let (verifier, recovery) = match raw.split_once('/') {
            Some((verifier, redirect)) => (verifier.to_string(), redirect == RECOVERY_REDIRECT),
            None => (raw, false),
        };
        if verifier.is_empty() {
            return Err(AuthError::MissingVerifier);
        }
        Ok((verifier, recovery))
    }

    pub fn sign_out(&self) {
        if self.session_slot().take().is_some() {
            let _ = self.events.send(AuthEvent::SignedOut);
        }
    }
}

impl AuthProvider for HttpAuthProvider {
    async fn set_session(&self, access_token: &str, refresh_token: &str) -> AuthResult<Session> {
        let builder = self
            .builder(Method::GET, "/auth/v1/user")?
            .bearer_auth(access_token);
        let user: UserResponse = self
            .send(builder)
            .await?
            .json()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))?;

        let session = Session {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at: None,
            user_id: Some(user.id),
        };
        Ok(self.establish(session, false))
    }

    async fn exchange_code_for_session(&self, code: &str) -> AuthResult<Session> {
        let (verifier, recovery) = self.take_verifier()?;
        let builder = self
            .builder(Method::POST, "/auth/v1/token?grant_type=pkce")?
            .json(&json!({ "auth_code": code, "code_verifier": verifier }));
        let session = self.token_request(builder).await?;

        if let Err(e) = self.store.remove_item(&self.verifier_key) {
            tracing::debug!(error = %e, "Failed to clear code verifier");
        }
        Ok(self.establish(session, recovery))
    }

    async fn verify_recovery_token_hash(&self, token_hash: &str) -> AuthResult<Session> {
        let builder = self
            .builder(Method::POST, "/auth/v1/verify")?
            .json(&json!({ "type": "recovery", "token_hash": token_hash }));
        let session = self.token_request(builder).await?;
        Ok(self.establish(session, true))
    }

    async fn verify_recovery_email_token(&self, email: &str, token: &str) -> AuthResult<Session> {
        let builder = self
            .builder(Method::POST, "/auth/v1/verify")?
            .json(&json!({ "type": "recovery", "email": email, "token": token }));
        let session = self.token_request(builder).await?;
        Ok(self.establish(session, true))
    }

    async fn get_session(&self) -> AuthResult<Option<Session>> {
        Ok(self.session_slot().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for HttpAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuthProvider")
            .field("base_url", &self.client.base_url().as_str())
            .field("signed_in", &self.session_slot().is_some())
            .finish()
    }
}
