//! Deadline-based polling.
//!
//! A [`PollSchedule`] is a poll interval plus an optional maximum duration
//! measured from the moment the wait starts. Waits observe a
//! [`CancellationToken`] so a stale worker stops between polls instead of
//! running out its deadline. Time comes from `tokio::time`, which lets tests
//! drive timeouts with a paused clock.

use crate::config::PollConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    /// `None` waits until the condition holds or the token is cancelled
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
    Cancelled,
}

impl PollSchedule {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }
}

impl From<PollConfig> for PollSchedule {
    fn from(poll: PollConfig) -> Self {
        PollSchedule::new(poll.interval(), poll.timeout())
    }
}

/// Evaluate `check` until it returns `true`, the deadline passes, or `token`
/// is cancelled. The condition is always evaluated at least once.
pub async fn poll_until<F, Fut>(
    schedule: PollSchedule,
    token: &CancellationToken,
    mut check: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = schedule
        .timeout
        .and_then(|timeout| Instant::now().checked_add(timeout));

    loop {
        if token.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if check().await {
            return WaitOutcome::Satisfied;
        }

        let sleep_for = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return WaitOutcome::TimedOut;
                }
                schedule.interval.min(deadline - now)
            }
            None => schedule.interval,
        };

        tokio::select! {
            () = token.cancelled() => return WaitOutcome::Cancelled,
            () = tokio::time::sleep(sleep_for) => {}
        }
    }
}
