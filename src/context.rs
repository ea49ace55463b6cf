//! Application context.
//!
//! # Responsibilities
//! - Build the shared service objects once from an `AppConfig`
//! - Hand out the breaker, guarded client, cache and auth provider
//! - Serve backend resources cache-first, one network call per resource at a time
//!
//! # Design Decisions
//! - Components are injected, never global; tests build their own context
//! - A store that fails to open degrades to memory, since a cache miss is always safe

use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::cache::{
    FileStore, KeyValueStore, MemoryStore, RequestDeduplicator, RequestError, SharedRequest, SwrCache,
    SwrOptions, SwrResult,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::recovery::{HttpAuthProvider, RecoveryResolver};
use crate::resilience::{CircuitBreaker, FetchError, GuardedClient};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid backend URL: {0}")]
    InvalidBackendUrl(#[from] url::ParseError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Failure of a cache-backed resource fetch.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("malformed response body: {0}")]
    Decode(String),

    #[error("invalid resource path: {0}")]
    InvalidPath(#[from] url::ParseError),
}

pub struct AppContext {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    breaker: Arc<CircuitBreaker>,
    client: GuardedClient,
    store: Arc<dyn KeyValueStore>,
    cache: SwrCache,
    requests: RequestDeduplicator<Value, ResourceError>,
    auth: Arc<HttpAuthProvider>,
}

impl AppContext {
    pub fn from_config(config: AppConfig) -> Result<Self, ContextError> {
        let store = open_store(&config);
        Self::with_parts(config, Arc::new(SystemClock), store)
    }

    /// Build a context around an explicit clock and store.
    pub fn with_parts(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ContextError> {
        let base_url = Url::parse(&config.backend.url)?;
        let http = reqwest::Client::builder()
            .timeout(config.backend.request_timeout())
            .build()?;

        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone(), clock.clone()));
        let client = GuardedClient::new(http, base_url, breaker.clone());
        let cache = SwrCache::new(store.clone(), clock.clone(), &config.cache);
        let auth = Arc::new(HttpAuthProvider::new(
            client.clone(),
            config.backend.anon_key.clone(),
            config.backend.request_timeout(),
            store.clone(),
            config.recovery.code_verifier_key.clone(),
        ));

        tracing::info!(
            backend = %config.backend.url,
            failure_threshold = config.circuit.failure_threshold,
            cache_version = %config.cache.version,
            "Application context ready"
        );

        Ok(Self {
            config,
            clock,
            breaker,
            client,
            store,
            cache,
            requests: RequestDeduplicator::new(),
            auth,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn client(&self) -> &GuardedClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn cache(&self) -> &SwrCache {
        &self.cache
    }

    pub fn auth(&self) -> &Arc<HttpAuthProvider> {
        &self.auth
    }

    pub fn recovery_resolver(&self) -> RecoveryResolver<HttpAuthProvider> {
        RecoveryResolver::new(self.auth.clone(), self.config.recovery.clone())
    }

    /// GET `path` from the backend as JSON. Concurrent calls for the same path share one request.
    pub fn fetch_json(&self, path: &str) -> SharedRequest<Value, ResourceError> {
        fetch_json(&self.requests, &self.client, &self.config.backend.anon_key, path)
    }

    /// Cached value for `key` now, plus a refresh of `path` when it is stale.
    pub fn load(&self, key: &str, path: &str, options: SwrOptions) -> SwrResult<Value, RequestError<ResourceError>> {
        let requests = self.requests.clone();
        let client = self.client.clone();
        let anon_key = self.config.backend.anon_key.clone();
        let path = path.to_string();
        self.cache
            .swr_fetch(key, move || fetch_json(&requests, &client, &anon_key, &path), options)
    }
}

fn fetch_json(
    requests: &RequestDeduplicator<Value, ResourceError>,
    client: &GuardedClient,
    anon_key: &str,
    path: &str,
) -> SharedRequest<Value, ResourceError> {
    let client = client.clone();
    let anon_key = anon_key.to_string();
    let owned_path = path.to_string();
    requests.request(path, move || async move {
        let url = client.backend_url(&owned_path)?;
        let request = client
            .request(Method::GET, url)
            .header("apikey", anon_key)
            .build()
            .map_err(FetchError::Network)?;
        let response = client.execute(request).await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ResourceError::Status(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ResourceError::Decode(e.to_string()))
    })
}

fn open_store(config: &AppConfig) -> Arc<dyn KeyValueStore> {
    match &config.cache.store_path {
        Some(path) => match FileStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Durable store unavailable, using memory");
                Arc::new(MemoryStore::new())
            }
        },
        None => Arc::new(MemoryStore::new()),
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("backend", &self.config.backend.url)
            .field("circuit", &self.breaker.state().status)
            .field("in_flight", &self.requests.in_flight())
            .finish()
    }
}
