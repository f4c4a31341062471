//! Bounded polling of external conditions.
//!
//! Servers, replicas and workloads are all observed from the outside, so most waits in the fleet
//! are "sample something every `interval` until it holds or `timeout` elapses".

use std::{
    future::Future,
    time::{Duration, Instant},
};

use thiserror::Error;

/// Result of a single check of a polled condition.
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; keep polling.
    NotYet,
    /// The condition can never hold; stop polling immediately.
    Failed(E),
}

#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("condition did not hold after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Permanent(E),
}

/// Polls `cond` every `interval` until it returns a value, fails permanently, or `timeout`
/// elapses. The condition is always checked at least once, even for a zero timeout.
pub async fn wait_for_condition<O, F, T, E>(
    mut cond: O,
    interval: Duration,
    timeout: Duration,
) -> Result<T, PollError<E>>
where
    O: FnMut() -> F,
    F: Future<Output = Result<T, CondCheckError<E>>>,
{
    let start = Instant::now();
    loop {
        match cond().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::Failed(e)) => return Err(PollError::Permanent(e)),
            Err(CondCheckError::NotYet) => {}
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PollError::TimedOut(elapsed));
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Polls a boolean check until it reports `true` or the timeout elapses.
/// Returns whether the check ever succeeded.
pub async fn wait_until<O, F>(mut check: O, interval: Duration, timeout: Duration) -> bool
where
    O: FnMut() -> F,
    F: Future<Output = bool>,
{
    let result: Result<(), PollError<std::convert::Infallible>> = wait_for_condition(
        || {
            let fut = check();
            async move {
                if fut.await {
                    Ok(())
                } else {
                    Err(CondCheckError::NotYet)
                }
            }
        },
        interval,
        timeout,
    )
    .await;
    result.is_ok()
}
