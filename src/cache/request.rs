//! Request coalescing helpers.
//!
//! # Responsibilities
//! - `RequestDeduplicator`: at most one in-flight request per key
//! - `Throttle`: leading-edge execution plus one trailing call per window
//! - `Debounced`: defer and merge bursts of calls
//!
//! # Design Decisions
//! - Shared outcomes carry errors as `Arc<E>` so every waiter gets the same value
//! - Deduplicated requests run as spawned tasks, so an entry settles and
//!   removes itself even when every caller has given up
//! - Removal is tagged by generation so a settling request never evicts its successor
//! - Timers use `tokio::time`, so these helpers must run inside a Tokio runtime

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::observability::metrics;

/// Outcome error shared between coalesced callers.
#[derive(Error)]
pub enum RequestError<E> {
    #[error("request failed: {0}")]
    Failed(Arc<E>),

    /// The coalesced execution was dropped before it produced a result.
    #[error("request cancelled")]
    Cancelled,
}

impl<E> Clone for RequestError<E> {
    fn clone(&self) -> Self {
        match self {
            RequestError::Failed(e) => RequestError::Failed(Arc::clone(e)),
            RequestError::Cancelled => RequestError::Cancelled,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for RequestError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            RequestError::Cancelled => f.write_str("Cancelled"),
        }
    }
}

impl<E> RequestError<E> {
    pub fn failed(error: E) -> Self {
        RequestError::Failed(Arc::new(error))
    }
}

pub type SharedRequest<T, E> = Shared<BoxFuture<'static, Result<T, RequestError<E>>>>;

/// Registry of in-flight requests keyed by a logical request key.
pub struct RequestDeduplicator<T, E> {
    inflight: Arc<DashMap<String, (u64, SharedRequest<T, E>)>>,
    generation: Arc<AtomicU64>,
}

impl<T, E> Clone for RequestDeduplicator<T, E> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<T, E> Default for RequestDeduplicator<T, E> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Removes a registry entry when its request settles, panics or is aborted.
struct SettleGuard<T, E> {
    inflight: Arc<DashMap<String, (u64, SharedRequest<T, E>)>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.inflight.remove_if(&self.key, |_, (id, _)| *id == generation);
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight request for `key`, or start one with `request_fn`.
    ///
    /// A new request is spawned on the runtime right away and runs to completion
    /// even if every caller drops its future. Every caller that joins before it
    /// settles observes the same outcome.
    pub fn request<F, Fut>(&self, key: &str, request_fn: F) -> SharedRequest<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                tracing::debug!(key, "Joining in-flight request");
                metrics::record_dedup_joined();
                entry.get().1.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.generation.fetch_add(1, Ordering::Relaxed);
                let settle = SettleGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: key.to_string(),
                    generation: id,
                };
                let task = tokio::spawn(async move {
                    let _settle = settle;
                    request_fn().await.map_err(RequestError::failed)
                });
                let shared = async move { task.await.unwrap_or(Err(RequestError::Cancelled)) }
                    .boxed()
                    .shared();
                entry.insert((id, shared.clone()));
                shared
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

struct ThrottleState<A> {
    last_run: Option<Instant>,
    pending: Option<A>,
    trailing_scheduled: bool,
}

struct ThrottleInner<A> {
    f: Box<dyn Fn(A) + Send + Sync>,
    interval: Duration,
    state: Mutex<ThrottleState<A>>,
}

impl<A> ThrottleInner<A> {
    fn lock(&self) -> MutexGuard<'_, ThrottleState<A>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_trailing(&self) {
        let pending = {
            let mut state = self.lock();
            state.trailing_scheduled = false;
            state.last_run = Some(Instant::now());
            state.pending.take()
        };
        if let Some(args) = pending {
            (self.f)(args);
        }
    }
}

/// Leading-edge throttle with a single trailing call carrying the latest arguments.
pub struct Throttle<A> {
    inner: Arc<ThrottleInner<A>>,
}

impl<A> Clone for Throttle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static> Throttle<A> {
    pub fn new<F>(f: F, interval: Duration) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                f: Box::new(f),
                interval,
                state: Mutex::new(ThrottleState {
                    last_run: None,
                    pending: None,
                    trailing_scheduled: false,
                }),
            }),
        }
    }

    pub fn call(&self, args: A) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        let window_elapsed = state
            .last_run
            .map_or(true, |last| now.duration_since(last) >= self.inner.interval);

        if window_elapsed && !state.trailing_scheduled {
            state.last_run = Some(now);
            drop(state);
            (self.inner.f)(args);
            return;
        }

        state.pending = Some(args);
        if !state.trailing_scheduled {
            state.trailing_scheduled = true;
            let run_at = state.last_run.map_or(now, |last| last + self.inner.interval);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep_until(run_at).await;
                inner.run_trailing();
            });
        }
    }
}

type Waiter<T, E> = oneshot::Sender<Result<T, RequestError<E>>>;

struct DebounceState<T, E> {
    last_call: Option<Instant>,
    generation: u64,
    waiters: Vec<Waiter<T, E>>,
}

struct DebounceInner<T, E> {
    fetch: Box<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>,
    delay: Duration,
    state: Mutex<DebounceState<T, E>>,
}

impl<T: Clone, E> DebounceInner<T, E> {
    fn lock(&self) -> MutexGuard<'_, DebounceState<T, E>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fire(&self, generation: u64) {
        let waiters = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            std::mem::take(&mut state.waiters)
        };
        let outcome = (self.fetch)().await.map_err(RequestError::failed);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Debounced fetch: calls inside `delay` of the previous call are deferred and merged.
pub struct Debounced<T, E> {
    inner: Arc<DebounceInner<T, E>>,
}

impl<T, E> Clone for Debounced<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Debounced<T, E>
where
    T: Clone + Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new<F, Fut>(fetch: F, delay: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(DebounceInner {
                fetch: Box::new(move || fetch().boxed()),
                delay,
                state: Mutex::new(DebounceState {
                    last_call: None,
                    generation: 0,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    pub async fn call(&self) -> Result<T, RequestError<E>> {
        let now = Instant::now();
        let deferred = {
            let mut state = self.inner.lock();
            let quiet = state
                .last_call
                .map_or(true, |last| now.duration_since(last) >= self.inner.delay);
            state.last_call = Some(now);

            if quiet && state.waiters.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                state.generation += 1;
                let generation = state.generation;
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(inner.delay).await;
                    inner.fire(generation).await;
                });
                Some(rx)
            }
        };

        match deferred {
            None => (self.inner.fetch)().await.map_err(RequestError::failed),
            Some(rx) => rx.await.unwrap_or(Err(RequestError::Cancelled)),
        }
    }
}
