//! Recovery session resolver.
//!
//! # Responsibilities
//! - Subscribe to auth events before touching the link, so no recovery event is missed
//! - Establish a session from the link with exactly one strategy
//! - Race the recovery event against session polling until the deadline
//! - Publish `RecoverySessionState` for UI gating and a canonical URL on success
//!
//! # State Transitions
//! ```text
//! Checking → SessionValid:   recovery event, or a polled session before the deadline
//! Checking → SessionInvalid: deadline reached without a session
//! ```
//!
//! # Design Decisions
//! - Strategy failures are logged and never fatal; polling still runs
//! - The event branch is polled first, so it wins a simultaneous finish
//! - After `cancel()` nothing is published, and the event subscription is dropped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::config::RecoveryConfig;
use crate::observability::metrics;
use crate::recovery::params::{canonical_recovery_url, EstablishStrategy, RecoveryUrlParams};
use crate::recovery::provider::{AuthEvent, AuthProvider, AuthResult, Session};

/// What the reset-password screen gates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RecoverySessionState {
    pub checking: bool,
    pub is_valid_session: bool,
}

impl RecoverySessionState {
    pub const CHECKING: Self = Self {
        checking: true,
        is_valid_session: false,
    };

    pub fn phase(&self) -> RecoveryPhase {
        match (self.checking, self.is_valid_session) {
            (true, _) => RecoveryPhase::Checking,
            (false, true) => RecoveryPhase::SessionValid,
            (false, false) => RecoveryPhase::SessionInvalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Checking,
    SessionValid,
    SessionInvalid,
}

/// Which branch of the race decided the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    RecoveryEvent,
    SessionPoll,
    Deadline,
}

impl ResolutionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionPath::RecoveryEvent => "recovery_event",
            ResolutionPath::SessionPoll => "session_poll",
            ResolutionPath::Deadline => "deadline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub phase: RecoveryPhase,
    pub path: ResolutionPath,
    /// Set when a valid session came from a recovery link.
    pub canonical_url: Option<Url>,
}

/// Handle to a running resolution. Dropping it cancels the resolution.
#[derive(Debug)]
pub struct RecoveryHandle {
    state: watch::Receiver<RecoverySessionState>,
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<RecoveryOutcome>>,
}

impl RecoveryHandle {
    pub fn state(&self) -> RecoverySessionState {
        *self.state.borrow()
    }

    /// Receiver for state changes.
    pub fn watch(&self) -> watch::Receiver<RecoverySessionState> {
        self.state.clone()
    }

    /// Stop polling and drop the event subscription. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for the terminal outcome. `None` if the resolution was cancelled.
    pub async fn finished(mut self) -> Option<RecoveryOutcome> {
        let task = self.task.take()?;
        match task.await {
            Ok(outcome) if !self.is_cancelled() => Some(outcome),
            Ok(_) => None,
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Recovery task failed");
                }
                None
            }
        }
    }
}

impl Drop for RecoveryHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.cancelled.store(true, Ordering::SeqCst);
            task.abort();
        }
    }
}

/// Publishes state unless the owner has cancelled.
struct Publisher {
    tx: watch::Sender<RecoverySessionState>,
    cancelled: Arc<AtomicBool>,
}

impl Publisher {
    fn publish(&self, state: RecoverySessionState) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send_replace(state);
        true
    }
}

pub struct RecoveryResolver<P> {
    provider: Arc<P>,
    config: RecoveryConfig,
}

impl<P: AuthProvider> RecoveryResolver<P> {
    pub fn new(provider: Arc<P>, config: RecoveryConfig) -> Self {
        Self { provider, config }
    }

    /// Start resolving `url` on the runtime. State starts at `checking`.
    pub fn spawn(&self, url: Url) -> RecoveryHandle {
        let (tx, rx) = watch::channel(RecoverySessionState::CHECKING);
        let cancelled = Arc::new(AtomicBool::new(false));
        let publisher = Publisher {
            tx,
            cancelled: cancelled.clone(),
        };

        let provider = self.provider.clone();
        let config = self.config.clone();
        let task = tokio::spawn(async move { resolve(provider, config, url, publisher).await });

        RecoveryHandle {
            state: rx,
            cancelled,
            task: Some(task),
        }
    }
}

async fn resolve<P: AuthProvider>(
    provider: Arc<P>,
    config: RecoveryConfig,
    url: Url,
    publisher: Publisher,
) -> RecoveryOutcome {
    let mut events = provider.subscribe();
    let deadline = Instant::now() + config.deadline();

    let params = RecoveryUrlParams::from_url(&url);
    let looks_like_recovery = params.looks_like_recovery();
    let strategy = if looks_like_recovery { params.strategy() } else { None };
    tracing::debug!(
        looks_like_recovery,
        strategy = strategy.as_ref().map_or("none", EstablishStrategy::name),
        "Resolving recovery session"
    );

    let path = tokio::select! {
        biased;
        _ = wait_for_recovery_event(&mut events) => ResolutionPath::RecoveryEvent,
        _ = establish_then_poll(&*provider, strategy, &config, deadline) => ResolutionPath::SessionPoll,
        _ = tokio::time::sleep_until(deadline) => ResolutionPath::Deadline,
    };
    drop(events);

    let valid = path != ResolutionPath::Deadline;
    let state = RecoverySessionState {
        checking: false,
        is_valid_session: valid,
    };
    // an event counts even when the URL carries no recovery markers
    let canonical_url = (path == ResolutionPath::RecoveryEvent || (valid && looks_like_recovery))
        .then(|| canonical_recovery_url(&url, &config.canonical_path));

    if publisher.publish(state) {
        metrics::record_recovery_outcome(if valid { "valid" } else { "invalid" }, path.as_str());
        if valid {
            tracing::info!(
                path = path.as_str(),
                canonical_url = canonical_url.as_ref().map(Url::as_str),
                "Recovery session valid"
            );
        } else {
            tracing::warn!(deadline_ms = config.deadline_ms, "No recovery session before deadline");
        }
    }

    RecoveryOutcome {
        phase: state.phase(),
        path,
        canonical_url,
    }
}

/// Resolves on the first `PasswordRecovery` event. Never resolves if the channel closes.
async fn wait_for_recovery_event(events: &mut broadcast::Receiver<AuthEvent>) {
    loop {
        match events.recv().await {
            Ok(AuthEvent::PasswordRecovery(_)) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Auth event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Runs the strategy, then polls until a session shows up. Only returns on success.
async fn establish_then_poll<P: AuthProvider>(
    provider: &P,
    strategy: Option<EstablishStrategy>,
    config: &RecoveryConfig,
    deadline: Instant,
) {
    if let Some(strategy) = strategy {
        let name = strategy.name();
        match tokio::time::timeout_at(deadline, establish(provider, strategy)).await {
            Ok(Ok(session)) => tracing::debug!(
                strategy = name,
                user_id = session.user_id.as_deref().unwrap_or("unknown"),
                "Recovery strategy established a session"
            ),
            Ok(Err(e)) => tracing::warn!(strategy = name, error = %e, "Recovery strategy failed"),
            Err(_) => tracing::warn!(strategy = name, "Recovery strategy did not finish before deadline"),
        }
    }

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match provider.get_session().await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Session lookup failed"),
        }
    }
}

async fn establish<P: AuthProvider>(provider: &P, strategy: EstablishStrategy) -> AuthResult<Session> {
    match strategy {
        EstablishStrategy::Tokens {
            access_token,
            refresh_token,
        } => provider.set_session(&access_token, &refresh_token).await,
        EstablishStrategy::CodeExchange { code } => provider.exchange_code_for_session(&code).await,
        EstablishStrategy::TokenHash { token_hash } => provider.verify_recovery_token_hash(&token_hash).await,
        EstablishStrategy::LegacyToken { email, token } => {
            provider.verify_recovery_email_token(&email, &token).await
        }
    }
}
