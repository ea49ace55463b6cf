//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client core.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Hosted backend (data, auth, realtime) settings.
    pub backend: BackendConfig,

    /// Circuit breaker thresholds and cooldowns.
    pub circuit: CircuitConfig,

    /// Local stale-while-revalidate cache settings.
    pub cache: CacheConfig,

    /// Password recovery resolution settings.
    pub recovery: RecoveryConfig,

    /// Status API listener.
    pub status: StatusConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Backend origin configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the hosted backend. Its origin is the one guarded by the circuit breaker.
    pub url: String,

    /// Public (anonymous) API key sent as the `apikey` header.
    pub anon_key: String,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
            request_timeout_secs: 15,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// Cooldown applied when the circuit first opens, in milliseconds.
    pub base_cooldown_ms: u64,

    /// Upper bound for the exponential cooldown, in milliseconds.
    pub max_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_ms: 3_000,
            max_cooldown_ms: 30_000,
        }
    }
}

/// Local cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Envelope version tag. Entries written with another tag are ignored.
    pub version: String,

    /// Prefix prepended to every cache key in the durable store.
    pub namespace: String,

    /// JSON file backing the durable store. In-memory only when unset.
    pub store_path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            namespace: "arxon_cache:".to_string(),
            store_path: None,
        }
    }
}

/// Password recovery resolution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Interval between session polls, in milliseconds.
    pub poll_interval_ms: u64,

    /// Total time allowed for a session to materialize, in milliseconds.
    pub deadline_ms: u64,

    /// Path the visible URL is rewritten to once a recovery session is established.
    pub canonical_path: String,

    /// Durable store key holding the PKCE code verifier.
    pub code_verifier_key: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300,
            deadline_ms: 8_000,
            canonical_path: "/reset-password".to_string(),
            code_verifier_key: "arxon-auth-token-code-verifier".to_string(),
        }
    }
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Status API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Bind address (e.g., "127.0.0.1:8787").
    pub bind_address: String,

    /// Bearer token required by the mutating endpoints. Unset means open.
    pub api_key: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8787".to_string(),
            api_key: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [backend]
            url = "https://abc.example.co"

            [circuit]
            failure_threshold = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.url, "https://abc.example.co");
        assert_eq!(config.backend.request_timeout_secs, 15);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.base_cooldown_ms, 3_000);
        assert_eq!(config.recovery.canonical_path, "/reset-password");
        assert_eq!(config.recovery.poll_interval(), Duration::from_millis(300));
        assert!(config.cache.store_path.is_none());
    }
}
