//! Guarded HTTP client.
//!
//! # Responsibilities
//! - Short-circuit calls to the backend origin while the breaker is open
//! - Classify backend responses as success or failure for the breaker
//! - Propagate an `x-request-id` on every guarded call
//! - Leave other origins completely untouched
//!
//! # Design Decisions
//! - HTTP 5xx and 429 are failures, but the response is still returned to the
//!   caller; business-level statuses are not swallowed
//! - Only the origin (scheme, host, port) is compared, never the path

use reqwest::header::HeaderValue;
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use url::{Origin, Url};
use uuid::Uuid;

use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitBreaker;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Errors surfaced by guarded calls.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The circuit is open; the call was not attempted.
    #[error("backend unavailable, retry in {retry_after_ms}ms")]
    BackendUnavailable { retry_after_ms: u64 },

    /// Transport-level failure (connect, TLS, timeout, body).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The caller cancelled the call.
    #[error("request aborted")]
    Aborted,
}

impl FetchError {
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            FetchError::BackendUnavailable { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// HTTP client whose calls to the backend origin are observed by a circuit breaker.
#[derive(Clone)]
pub struct GuardedClient {
    client: Client,
    base_url: Url,
    origin: Origin,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedClient {
    pub fn new(client: Client, base_url: Url, breaker: Arc<CircuitBreaker>) -> Self {
        let origin = base_url.origin();
        Self {
            client,
            base_url,
            origin,
            breaker,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` (which may carry a query string) against the backend base URL.
    pub fn backend_url(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }

    /// Start building a request with the underlying client.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// True when `url` belongs to the guarded backend origin.
    pub fn is_guarded(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    /// Send a request.
    ///
    /// Dropping the returned future before it completes leaves the breaker untouched.
    pub async fn execute(&self, request: Request) -> Result<Response, FetchError> {
        self.execute_abortable(request, std::future::pending::<()>()).await
    }

    /// Send a request, giving up with [`FetchError::Aborted`] if `abort` completes first.
    pub async fn execute_abortable<A>(
        &self,
        mut request: Request,
        abort: A,
    ) -> Result<Response, FetchError>
    where
        A: Future<Output = ()>,
    {
        if !self.is_guarded(request.url()) {
            return tokio::select! {
                biased;
                _ = abort => Err(FetchError::Aborted),
                result = self.client.execute(request) => result.map_err(FetchError::Network),
            };
        }

        let now = self.breaker.now_ms();
        if let Some(retry_after_ms) = self.breaker.retry_after_ms(now) {
            tracing::debug!(
                url = %request.url(),
                retry_after_ms,
                "Backend circuit open, short-circuiting request"
            );
            metrics::record_guarded_request("short_circuited");
            return Err(FetchError::BackendUnavailable { retry_after_ms });
        }

        let request_id = Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            request.headers_mut().insert(X_REQUEST_ID, value);
        }
        let method = request.method().clone();
        let path = request.url().path().to_string();

        let result = tokio::select! {
            biased;
            _ = abort => {
                tracing::debug!(request_id = %request_id, method = %method, path = %path, "Request aborted by caller");
                metrics::record_guarded_request("aborted");
                return Err(FetchError::Aborted);
            }
            result = self.client.execute(request) => result,
        };

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    tracing::warn!(
                        request_id = %request_id,
                        method = %method,
                        path = %path,
                        status = %status,
                        "Backend returned failure status"
                    );
                    metrics::record_guarded_request("failure");
                    self.breaker.record_failure(format!("HTTP {}", status.as_u16()));
                } else {
                    metrics::record_guarded_request("success");
                    self.breaker.record_success();
                }
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    error = %e,
                    "Backend request failed"
                );
                metrics::record_guarded_request("failure");
                self.breaker.record_failure(e.to_string());
                Err(FetchError::Network(e))
            }
        }
    }
}

impl std::fmt::Debug for GuardedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedClient")
            .field("base_url", &self.base_url.as_str())
            .field("circuit", &self.breaker.state().status)
            .finish()
    }
}
