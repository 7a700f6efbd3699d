// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deadline-bounded polling with backoff.
//!
//! Drivers express "wait for terminal state" as a closure returning
//! `Ok(None)` until there is a transition; the helper owns the sleeping,
//! the backoff growth, and the deadline check. No sleep-in-a-loop in
//! driver code.

use coral_error::CoralError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Backoff schedule for a polling loop.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay before the second poll.
    pub initial: Duration,
    /// Upper bound on the delay between polls.
    pub max: Duration,
    /// Multiplier applied after each empty poll.
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            factor: 1.5,
        }
    }
}

impl Backoff {
    /// A schedule that starts at `initial` and is capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Self::default()
        }
    }

    fn next(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.factor);
        grown.min(self.max)
    }
}

/// Poll `op` until it yields a value or `deadline` elapses.
///
/// `op` returns `Ok(Some(v))` when done, `Ok(None)` for an empty
/// transition (the loop backs off), or an error (propagated as-is).
///
/// # Errors
///
/// Returns an executor-kind [`CoralError`] mentioning `what` when the
/// deadline elapses; inner errors propagate unchanged.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    deadline: Duration,
    backoff: Backoff,
    mut op: F,
) -> Result<T, CoralError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, CoralError>>,
{
    let started = Instant::now();
    let mut delay = backoff.initial;
    loop {
        if let Some(value) = op().await? {
            return Ok(value);
        }
        if started.elapsed() + delay > deadline {
            return Err(CoralError::executor(format!(
                "timed out after {}s waiting for {what}",
                deadline.as_secs()
            )));
        }
        trace!(what, delay_ms = delay.as_millis() as u64, "poll backoff");
        tokio::time::sleep(delay).await;
        delay = backoff.next(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let value = poll_until("test", Duration::from_secs(60), Backoff::default(), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(if n >= 2 { Some("done") } else { None })
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_into_executor_error() {
        let err = poll_until::<&str, _, _>(
            "job state",
            Duration::from_secs(5),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(2)),
            || async { Ok(None) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), coral_error::ErrorKind::Executor);
        assert!(err.message.contains("job state"), "{}", err.message);
    }

    #[tokio::test(start_paused = true)]
    async fn inner_errors_propagate() {
        let err = poll_until::<(), _, _>(
            "test",
            Duration::from_secs(5),
            Backoff::default(),
            || async { Err(CoralError::artifact("boom")) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), coral_error::ErrorKind::Artifact);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3));
        let d1 = backoff.next(Duration::from_secs(1));
        let d2 = backoff.next(d1);
        let d3 = backoff.next(d2);
        assert!(d1 > Duration::from_secs(1));
        assert!(d3 <= Duration::from_secs(3));
    }
}
