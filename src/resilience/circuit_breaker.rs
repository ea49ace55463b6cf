//! Circuit breaker for backend protection.
//!
//! # States
//! - Up: requests pass through; isolated failures are counted but invisible
//! - Down: backend assumed unreachable, guarded calls fail fast until `next_retry_at`
//!
//! # State Transitions
//! ```text
//! Up → Down:   consecutive_failures >= failure_threshold
//! Down → Down: probe after cooldown fails, cooldown doubles (capped)
//! any → Up:    first success, or an explicit reset()
//! ```
//!
//! # Design Decisions
//! - One breaker per backend origin, owned by `AppContext` and shared via Arc
//! - Fail fast while open, no network attempt
//! - No half-open phase: the first call after the cooldown is the probe, and
//!   its success fully closes the circuit
//! - Listeners run after the mutation, outside the state lock, with the new snapshot

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::CircuitConfig;
use crate::observability::metrics;

/// Reachability of the backend as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitStatus {
    Up,
    Down,
}

impl CircuitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitStatus::Up => "up",
            CircuitStatus::Down => "down",
        }
    }
}

/// Snapshot of the breaker. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub last_error_message: Option<String>,
    pub last_error_at: Option<u64>,
    pub next_retry_at: Option<u64>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Up,
            consecutive_failures: 0,
            last_error_message: None,
            last_error_at: None,
            next_retry_at: None,
        }
    }
}

impl CircuitState {
    /// True while the cooldown window is still running.
    pub fn is_open(&self, now_ms: u64) -> bool {
        self.status == CircuitStatus::Down && self.next_retry_at.is_some_and(|at| now_ms < at)
    }

    /// Milliseconds left in the cooldown, if the circuit is open.
    pub fn retry_after_ms(&self, now_ms: u64) -> Option<u64> {
        if self.is_open(now_ms) {
            self.next_retry_at.map(|at| at - now_ms)
        } else {
            None
        }
    }
}

type Listener = Arc<dyn Fn(&CircuitState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Listener>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Listener>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, state: &CircuitState) {
        let listeners: Vec<Listener> = self.lock().values().cloned().collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// Handle returned by [`CircuitBreaker::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    listeners: Weak<Listeners>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().remove(&self.id);
        }
    }
}

/// Backend health circuit breaker.
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
    listeners: Arc<Listeners>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(CircuitState::default()),
            listeners: Arc::new(Listeners::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current snapshot.
    pub fn state(&self) -> CircuitState {
        self.lock().clone()
    }

    pub fn is_open(&self, now_ms: u64) -> bool {
        self.lock().is_open(now_ms)
    }

    pub fn retry_after_ms(&self, now_ms: u64) -> Option<u64> {
        self.lock().retry_after_ms(now_ms)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Register a callback invoked with the new snapshot on every state change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CircuitState) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Cooldown applied once `failures` consecutive failures have been observed.
    pub fn cooldown_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.config.failure_threshold);
        let multiplier = 2u64.saturating_pow(exponent);
        let delay_ms = self
            .config
            .base_cooldown_ms
            .saturating_mul(multiplier)
            .min(self.config.max_cooldown_ms);
        Duration::from_millis(delay_ms)
    }

    /// Observe a successful backend response.
    pub fn record_success(&self) {
        self.close("success");
    }

    /// Force the circuit closed (user-triggered "retry now").
    pub fn reset(&self) {
        self.close("reset");
    }

    fn close(&self, reason: &'static str) {
        let snapshot = {
            let mut state = self.lock();
            if state.status == CircuitStatus::Up && state.consecutive_failures == 0 {
                return;
            }
            let was_down = state.status == CircuitStatus::Down;
            state.status = CircuitStatus::Up;
            state.consecutive_failures = 0;
            state.next_retry_at = None;
            if was_down {
                tracing::info!(reason, "Backend circuit closed");
                metrics::record_circuit_transition("up");
            }
            state.clone()
        };
        self.listeners.notify(&snapshot);
    }

    /// Observe a failed backend call (HTTP 5xx/429 or transport error).
    pub fn record_failure(&self, message: impl Into<String>) {
        let now = self.clock.now_ms();
        let message = message.into();
        let snapshot = {
            let mut state = self.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error_message = Some(message);
            state.last_error_at = Some(now);

            if state.consecutive_failures >= self.config.failure_threshold {
                let cooldown = self.cooldown_for(state.consecutive_failures);
                state.status = CircuitStatus::Down;
                state.next_retry_at = Some(now + cooldown.as_millis() as u64);
                tracing::warn!(
                    failures = state.consecutive_failures,
                    cooldown_ms = cooldown.as_millis() as u64,
                    error = state.last_error_message.as_deref().unwrap_or_default(),
                    "Backend circuit open"
                );
                metrics::record_circuit_transition("down");
            } else {
                tracing::debug!(
                    failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Backend failure recorded"
                );
            }
            state.clone()
        };
        self.listeners.notify(&snapshot);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
