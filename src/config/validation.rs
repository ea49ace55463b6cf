//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and cross-field
//! constraints. All errors are collected, not just the first.

use std::fmt;
use std::net::SocketAddr;
use url::Url;

use crate::config::schema::AppConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match Url::parse(&config.backend.url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(ValidationError::new(
            "backend.url",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new("backend.url", e.to_string())),
    }
    if config.backend.request_timeout_secs == 0 {
        errors.push(ValidationError::new("backend.request_timeout_secs", "must be > 0"));
    }

    if config.circuit.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit.failure_threshold", "must be > 0"));
    }
    if config.circuit.base_cooldown_ms == 0 {
        errors.push(ValidationError::new("circuit.base_cooldown_ms", "must be > 0"));
    }
    if config.circuit.base_cooldown_ms > config.circuit.max_cooldown_ms {
        errors.push(ValidationError::new(
            "circuit.max_cooldown_ms",
            "must be >= circuit.base_cooldown_ms",
        ));
    }

    if config.cache.version.is_empty() {
        errors.push(ValidationError::new("cache.version", "must not be empty"));
    }

    if config.recovery.poll_interval_ms == 0 {
        errors.push(ValidationError::new("recovery.poll_interval_ms", "must be > 0"));
    }
    if config.recovery.poll_interval_ms >= config.recovery.deadline_ms {
        errors.push(ValidationError::new(
            "recovery.deadline_ms",
            "must be greater than recovery.poll_interval_ms",
        ));
    }
    if !config.recovery.canonical_path.starts_with('/') {
        errors.push(ValidationError::new("recovery.canonical_path", "must start with '/'"));
    }

    if config.status.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("status.bind_address", "must be a socket address"));
    }
    if config.status.api_key.as_deref() == Some("") {
        errors.push(ValidationError::new("status.api_key", "must not be empty when set"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "must be a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
