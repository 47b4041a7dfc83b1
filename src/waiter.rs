//! Cooperative poll/retry primitive used at every suspension point.
//!
//! A wait never blocks the thread: between polls it sleeps on the process's
//! own tokio runtime, so timers and other tasks keep running. There is no
//! implicit timeout. Callers that want one set [`WaitPolicy::max_polls`].

use crate::error::{PipelineError, Result};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one predicate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<P> {
    /// The awaited condition holds.
    Ready,
    /// The output was closed; the condition can no longer be satisfied.
    Closed,
    /// Not yet. Carries the state reported in progress diagnostics.
    Pending(P),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Closed,
}

/// How a wait ended and what it cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waited {
    pub outcome: WaitOutcome,
    /// Predicate evaluations that returned `Pending`.
    pub polls: u32,
    /// Progress diagnostics emitted along the way.
    pub diagnostics: u32,
    pub elapsed: Duration,
}

impl Waited {
    pub fn is_ready(&self) -> bool {
        self.outcome == WaitOutcome::Ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Sleep between polls; zero just yields to the runtime.
    pub poll: Duration,
    /// Retry ceiling. `None` waits indefinitely.
    pub max_polls: Option<u32>,
    /// Polls tolerated silently before diagnostics start.
    pub progress_after: u32,
}

impl WaitPolicy {
    pub fn new(poll: Duration, progress_after: u32) -> Self {
        Self {
            poll,
            max_polls: None,
            progress_after,
        }
    }

    pub fn with_max_polls(mut self, max_polls: Option<u32>) -> Self {
        self.max_polls = max_polls;
        self
    }
}

/// Poll `predicate` until it reports `Ready` or `Closed`.
///
/// Past `progress_after` polls, every further poll logs the pending state. The
/// first of those, and then one every `progress_after` polls, is a warning.
/// Exceeding `max_polls` returns
/// [`PipelineError::WaitTimeout`] naming `what`.
pub async fn wait_until<P, F>(
    what: &'static str,
    policy: &WaitPolicy,
    mut predicate: F,
) -> Result<Waited>
where
    P: fmt::Debug,
    F: FnMut() -> Readiness<P>,
{
    let started = Instant::now();
    let mut polls = 0u32;
    let mut diagnostics = 0u32;
    let warn_every = policy.progress_after.max(1);

    loop {
        let outcome = match predicate() {
            Readiness::Ready => WaitOutcome::Ready,
            Readiness::Closed => WaitOutcome::Closed,
            Readiness::Pending(progress) => {
                if let Some(max) = policy.max_polls {
                    if polls >= max {
                        warn!(what, polls, ?progress, "Giving up wait");
                        return Err(PipelineError::WaitTimeout { what, polls });
                    }
                }
                polls += 1;

                if polls > policy.progress_after {
                    diagnostics += 1;
                    let beyond = polls - policy.progress_after;
                    let periodic = warn_every > 1 && beyond % warn_every == 1;
                    if beyond == 1 || periodic {
                        warn!(
                            what,
                            polls,
                            waited_ms = started.elapsed().as_millis() as u64,
                            ?progress,
                            "Still waiting"
                        );
                    } else {
                        debug!(what, polls, ?progress, "Still waiting");
                    }
                }

                if policy.poll.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(policy.poll).await;
                }
                continue;
            }
        };

        return Ok(Waited {
            outcome,
            polls,
            diagnostics,
            elapsed: started.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(progress_after: u32) -> WaitPolicy {
        WaitPolicy::new(Duration::from_millis(1), progress_after)
    }

    #[tokio::test]
    async fn test_ready_immediately() {
        let waited = wait_until::<(), _>("test", &policy(5), || Readiness::Ready)
            .await
            .unwrap();
        assert_eq!(waited.outcome, WaitOutcome::Ready);
        assert_eq!(waited.polls, 0);
        assert_eq!(waited.diagnostics, 0);
    }

    #[tokio::test]
    async fn test_ready_after_some_polls() {
        let calls = Cell::new(0);
        let waited = wait_until("test", &policy(100), || {
            calls.set(calls.get() + 1);
            if calls.get() > 3 {
                Readiness::Ready
            } else {
                Readiness::Pending(calls.get())
            }
        })
        .await
        .unwrap();
        assert!(waited.is_ready());
        assert_eq!(waited.polls, 3);
        assert_eq!(waited.diagnostics, 0);
    }

    #[tokio::test]
    async fn test_closed_ends_wait() {
        let calls = Cell::new(0);
        let waited = wait_until("test", &policy(100), || {
            calls.set(calls.get() + 1);
            if calls.get() == 2 {
                Readiness::Closed
            } else {
                Readiness::Pending(())
            }
        })
        .await
        .unwrap();
        assert_eq!(waited.outcome, WaitOutcome::Closed);
        assert_eq!(waited.polls, 1);
    }

    #[tokio::test]
    async fn test_diagnostics_beyond_threshold_only() {
        let calls = Cell::new(0u32);
        let waited = wait_until("test", &policy(2), || {
            calls.set(calls.get() + 1);
            if calls.get() > 6 {
                Readiness::Ready
            } else {
                Readiness::Pending(calls.get())
            }
        })
        .await
        .unwrap();
        assert_eq!(waited.polls, 6);
        assert_eq!(waited.diagnostics, 4);
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_fatal() {
        let policy = policy(1).with_max_polls(Some(4));
        let err = wait_until("backend open", &policy, || Readiness::Pending("opening"))
            .await
            .unwrap_err();
        match err {
            PipelineError::WaitTimeout { what, polls } => {
                assert_eq!(what, "backend open");
                assert_eq!(polls, 4);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_interval_yields_to_other_tasks() {
        let flag = std::rc::Rc::new(Cell::new(false));
        let setter = flag.clone();
        let policy = WaitPolicy::new(Duration::ZERO, 1000);

        let (waited, ()) = tokio::join!(
            wait_until("flag", &policy, || {
                if flag.get() {
                    Readiness::Ready
                } else {
                    Readiness::<()>::Pending(())
                }
            }),
            async move {
                tokio::task::yield_now().await;
                setter.set(true);
            }
        );
        assert!(waited.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_sleeping_wait_lets_timers_run() {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(20);
        let waited = wait_until("deadline", &policy(1000), || {
            if Instant::now() >= deadline {
                Readiness::Ready
            } else {
                Readiness::Pending(())
            }
        })
        .await
        .unwrap();
        assert!(waited.elapsed >= Duration::from_millis(20));
        assert!(waited.polls >= 1);
    }
}
