//! Guarded client, breaker and cache against a live mock backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arxon_core::cache::{RequestError, SwrOptions};
use arxon_core::context::ResourceError;
use arxon_core::resilience::{CircuitStatus, FetchError, X_REQUEST_ID};
use reqwest::Method;

mod common;

async fn get(context: &arxon_core::AppContext, url: &str) -> Result<reqwest::Response, FetchError> {
    let request = context
        .client()
        .request(Method::GET, url::Url::parse(url).unwrap())
        .build()
        .unwrap();
    context.client().execute(request).await
}

#[tokio::test]
async fn test_outage_opens_circuit_and_short_circuits() {
    let healthy = Arc::new(AtomicU32::new(0));
    let flag = healthy.clone();
    let backend = common::start_programmable_backend(move |_req| {
        let flag = flag.clone();
        async move {
            if flag.load(Ordering::SeqCst) == 1 {
                (200, "[]".into())
            } else {
                (503, r#"{"message":"unavailable"}"#.into())
            }
        }
    })
    .await;
    let (clock, context) = common::test_context(&backend.url());
    let endpoint = format!("{}/rest/v1/profiles", backend.url());

    // failures are returned to the caller, not swallowed
    for _ in 0..3 {
        let response = get(&context, &endpoint).await.unwrap();
        assert_eq!(response.status(), 503);
    }
    let state = context.breaker().state();
    assert_eq!(state.status, CircuitStatus::Down);
    assert_eq!(state.consecutive_failures, 3);
    assert_eq!(state.last_error_message.as_deref(), Some("HTTP 503"));

    clock.advance(Duration::from_millis(1000));
    let err = get(&context, &endpoint).await.unwrap_err();
    assert!(matches!(err, FetchError::BackendUnavailable { retry_after_ms: 2000 }));
    assert_eq!(backend.hits(), 3, "open circuit must not reach the backend");

    // cooldown over: the next call is the probe, and it succeeds
    healthy.store(1, Ordering::SeqCst);
    clock.advance(Duration::from_millis(2000));
    let response = get(&context, &endpoint).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(backend.hits(), 4);

    let state = context.breaker().state();
    assert_eq!(state.status, CircuitStatus::Up);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.next_retry_at, None);
}

#[tokio::test]
async fn test_failed_probe_doubles_cooldown() {
    let backend = common::start_programmable_backend(|_req| async { (502, "{}".into()) }).await;
    let (clock, context) = common::test_context(&backend.url());
    let endpoint = format!("{}/rest/v1/mining_sessions", backend.url());

    for _ in 0..3 {
        get(&context, &endpoint).await.unwrap();
    }
    clock.advance(Duration::from_millis(3000));
    get(&context, &endpoint).await.unwrap();

    let now = context.breaker().now_ms();
    assert_eq!(context.breaker().retry_after_ms(now), Some(6000));
}

#[tokio::test]
async fn test_rate_limit_counts_as_failure() {
    let backend = common::start_programmable_backend(|_req| async { (429, "{}".into()) }).await;
    let (_clock, context) = common::test_context(&backend.url());

    let response = get(&context, &format!("{}/rest/v1/leaderboard", backend.url())).await.unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(context.breaker().state().consecutive_failures, 1);
    assert_eq!(context.breaker().state().status, CircuitStatus::Up);
}

#[tokio::test]
async fn test_client_errors_are_successes() {
    let backend = common::start_programmable_backend(|_req| async { (404, "{}".into()) }).await;
    let (_clock, context) = common::test_context(&backend.url());
    context.breaker().record_failure("HTTP 503");

    let response = get(&context, &format!("{}/rest/v1/missing", backend.url())).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(context.breaker().state().consecutive_failures, 0);
}

#[tokio::test]
async fn test_other_origins_bypass_breaker() {
    let backend = common::start_programmable_backend(|_req| async { (200, "{}".into()) }).await;
    let other = common::start_programmable_backend(|_req| async { (503, "{}".into()) }).await;
    let (_clock, context) = common::test_context(&backend.url());

    for _ in 0..5 {
        let response = get(&context, &format!("{}/cdn/banner.json", other.url())).await.unwrap();
        assert_eq!(response.status(), 503);
    }
    assert_eq!(context.breaker().state().consecutive_failures, 0);

    // even an open circuit does not block foreign origins
    for _ in 0..3 {
        context.breaker().record_failure("HTTP 503");
    }
    assert!(get(&context, &format!("{}/cdn/banner.json", other.url())).await.is_ok());
    assert_eq!(other.hits(), 6);
}

#[tokio::test]
async fn test_guarded_requests_carry_request_id() {
    let backend = common::start_programmable_backend(|req| async move {
        match req.header(X_REQUEST_ID) {
            Some(id) if uuid::Uuid::parse_str(id).is_ok() => (200, "{}".into()),
            _ => (400, "{}".into()),
        }
    })
    .await;
    let (_clock, context) = common::test_context(&backend.url());

    let response = get(&context, &format!("{}/rest/v1/profiles", backend.url())).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_abort_is_not_a_failure() {
    let backend = common::start_programmable_backend(|_req| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        (503, "{}".into())
    })
    .await;
    let (_clock, context) = common::test_context(&backend.url());

    let request = context
        .client()
        .request(Method::GET, url::Url::parse(&format!("{}/slow", backend.url())).unwrap())
        .build()
        .unwrap();
    let abort = tokio::time::sleep(Duration::from_millis(50));
    let err = context.client().execute_abortable(request, abort).await.unwrap_err();
    assert!(matches!(err, FetchError::Aborted));
    assert_eq!(context.breaker().state().consecutive_failures, 0);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_request() {
    let backend = common::start_programmable_backend(|req| async move {
        assert_eq!(req.header("apikey"), Some("anon-test-key"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        (200, r#"[{"rank":1,"user":"alice"}]"#.into())
    })
    .await;
    let (_clock, context) = common::test_context(&backend.url());

    let calls: Vec<_> = (0..5).map(|_| context.fetch_json("/rest/v1/leaderboard")).collect();
    let results = futures_util::future::join_all(calls).await;

    assert_eq!(backend.hits(), 1);
    for result in results {
        assert_eq!(result.unwrap()[0]["user"], "alice");
    }

    // settled requests leave the registry; the next call goes to the network again
    context.fetch_json("/rest/v1/leaderboard").await.unwrap();
    assert_eq!(backend.hits(), 2);
}

#[tokio::test]
async fn test_swr_load_refreshes_and_writes_back() {
    let version = Arc::new(AtomicU32::new(1));
    let current = version.clone();
    let backend = common::start_programmable_backend(move |_req| {
        let current = current.clone();
        async move { (200, format!(r#"{{"balance":{}}}"#, current.load(Ordering::SeqCst))) }
    })
    .await;
    let (clock, context) = common::test_context(&backend.url());
    let options = SwrOptions {
        stale_after: Duration::from_secs(30),
        expire_after: Duration::from_secs(600),
    };

    let first = context.load("wallet:u1", "/rest/v1/wallets?user_id=eq.u1", options);
    assert!(first.cached.is_none());
    assert!(first.needs_fetch);
    assert_eq!(first.fresh.await.unwrap()["balance"], 1);

    let cached = context.load("wallet:u1", "/rest/v1/wallets?user_id=eq.u1", options);
    assert!(!cached.needs_fetch);
    assert_eq!(cached.cached.unwrap()["balance"], 1);
    assert_eq!(backend.hits(), 1);

    version.store(2, Ordering::SeqCst);
    clock.advance(Duration::from_secs(31));
    let stale = context.load("wallet:u1", "/rest/v1/wallets?user_id=eq.u1", options);
    assert_eq!(stale.cached.as_ref().unwrap()["balance"], 1);
    assert!(stale.needs_fetch);
    assert_eq!(stale.fresh.await.unwrap()["balance"], 2);
    assert_eq!(context.cache().inspect("wallet:u1").unwrap().age_ms, 0);
}

#[tokio::test]
async fn test_swr_load_surfaces_http_errors() {
    let backend = common::start_programmable_backend(|_req| async { (401, r#"{"message":"JWT expired"}"#.into()) }).await;
    let (_clock, context) = common::test_context(&backend.url());
    let options = SwrOptions {
        stale_after: Duration::from_secs(30),
        expire_after: Duration::from_secs(600),
    };

    let result = context.load("profile:u1", "/rest/v1/profiles", options);
    match result.fresh.await.unwrap_err() {
        RequestError::Failed(e) => assert!(matches!(*e, ResourceError::Status(401))),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(context.cache().inspect("profile:u1").is_none());
}

#[tokio::test]
async fn test_open_circuit_stays_down_without_callers() {
    let backend = common::start_programmable_backend(|_req| async { (200, "{}".into()) }).await;
    let (clock, context) = common::test_context(&backend.url());
    for _ in 0..3 {
        context.breaker().record_failure("HTTP 503");
    }

    clock.advance(Duration::from_millis(3000));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // the core never retries on its own; only a caller moves the circuit
    assert_eq!(backend.hits(), 0);
    assert_eq!(context.breaker().state().status, CircuitStatus::Down);

    get(&context, &format!("{}/rest/v1/profiles", backend.url())).await.unwrap();
    assert_eq!(backend.hits(), 1);
    assert_eq!(context.breaker().state().status, CircuitStatus::Up);
}
