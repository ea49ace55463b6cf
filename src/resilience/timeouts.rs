//! Timeout enforcement.
//!
//! `with_timeout` races an operation against a timer. The losing operation is
//! dropped, but any request it already put on the wire may still complete on
//! the server: a timeout means "outcome unknown", not "aborted".

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// The timer won the race.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} timed out after {}ms", .after.as_millis())]
pub struct TimeoutError {
    pub operation: &'static str,
    pub after: Duration,
}

pub async fn with_timeout<F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| TimeoutError { operation, after })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_completes() {
        let value = with_timeout("noop", Duration::from_secs(1), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let err = with_timeout("session lookup", Duration::from_millis(500), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await
        .unwrap_err();

        assert_eq!(err.after, Duration::from_millis(500));
        assert_eq!(err.to_string(), "session lookup timed out after 500ms");
    }
}
