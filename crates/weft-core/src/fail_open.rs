//! Side effects that may fail without failing the plan
//!
//! Plan events, recovery records, dispatcher statistics and task-list
//! snapshots are written through here. Errors surface as a `warn!` line
//! and a `None`; callers carry on. Task outcomes never pass through here.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Await `fut`; an error is logged under `label` and dropped
///
/// ```no_run
/// use weft_core::fail_open::fail_open;
/// use weft_core::Result;
///
/// async fn record_event() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     if fail_open("scheduler::record_plan_event", record_event()).await.is_none() {
///         // already logged
///     }
/// }
/// ```
pub async fn fail_open<Fut, T>(label: &str, fut: Fut) -> Option<T>
where
    Fut: Future<Output = Result<T>>,
{
    fut.await
        .map_err(|e| warn!(op = label, "side effect failed, continuing: {}", e))
        .ok()
}

/// [`fail_open`] with linear backoff between attempts
///
/// `make` builds a fresh future per attempt. After attempt `n` fails the
/// helper sleeps `step * n`. At least one attempt is always made.
pub async fn fail_open_with_retries<F, Fut, T>(
    label: &str,
    mut make: F,
    attempts: usize,
    step: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match make().await {
            Ok(val) => return Some(val),
            Err(e) => e,
        };
        if attempt >= attempts {
            warn!(op = label, attempts, "side effect gave up, continuing: {}", err);
            return None;
        }
        warn!(op = label, attempt, attempts, "side effect failed, retrying: {}", err);
        tokio::time::sleep(step * attempt as u32).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WeftError;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_error_becomes_none() {
        let ok = fail_open("ok", async { Ok::<_, WeftError>("written") }).await;
        assert_eq!(ok, Some("written"));

        let err = fail_open("err", async {
            Err::<(), _>(WeftError::MemoryWrite("read-only filesystem".to_string()))
        })
        .await;
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_second_attempt_wins() {
        let calls = Cell::new(0);
        let got = fail_open_with_retries(
            "snapshot",
            || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    match n {
                        1 => Err(WeftError::Other("rename raced".to_string())),
                        _ => Ok(n),
                    }
                }
            },
            4,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(got, Some(2));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_last_attempt() {
        let calls = Cell::new(0);
        let got = fail_open_with_retries(
            "snapshot",
            || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(WeftError::Other("disk gone".to_string())) }
            },
            2,
            Duration::from_millis(1),
        )
        .await;
        assert!(got.is_none());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = Cell::new(0);
        let got = fail_open_with_retries(
            "snapshot",
            || {
                calls.set(calls.get() + 1);
                async { Ok::<_, WeftError>(()) }
            },
            0,
            Duration::ZERO,
        )
        .await;
        assert!(got.is_some());
        assert_eq!(calls.get(), 1);
    }
}
