//! Readiness polling against an eventually-consistent backend.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

const BODY_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: u16,
    pub body: String,
}

impl CheckOutcome {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// The last thing a session saw before giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Response(CheckOutcome),
    CheckFailed(String),
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Response(outcome) => {
                write!(f, "HTTP {}: {}", outcome.status, excerpt(&outcome.body))
            }
            Observation::CheckFailed(message) => write!(f, "check failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub checks: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("upstream failure after {checks} check(s): HTTP {status}: {}", excerpt(.body))]
    Upstream {
        status: u16,
        body: String,
        checks: u32,
    },
    #[error("not ready after {elapsed:?} ({checks} check(s)); last observed: {}", describe_last(.last))]
    Timeout {
        elapsed: Duration,
        checks: u32,
        last: Option<Observation>,
    },
}

pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

fn describe_last(last: &Option<Observation>) -> String {
    match last {
        Some(observation) => observation.to_string(),
        None => "nothing".to_string(),
    }
}

pub fn server_error(outcome: &CheckOutcome) -> bool {
    outcome.status >= 500
}

/// Ready once the check returns 200 and the body no longer contains
/// `sentinel`.
pub fn ready_unless_body_contains(
    sentinel: impl Into<String>,
) -> impl Fn(&CheckOutcome) -> bool + Send + Sync + 'static {
    let sentinel = sentinel.into();
    move |outcome: &CheckOutcome| outcome.status == 200 && !outcome.body.contains(sentinel.as_str())
}

type OutcomePredicate = Box<dyn Fn(&CheckOutcome) -> bool + Send + Sync>;

#[derive(Debug)]
enum Decision {
    Ready,
    Pending,
    Failed,
}

pub struct PollSession {
    interval: Duration,
    deadline: Duration,
    ready: OutcomePredicate,
    instant_failure: Option<OutcomePredicate>,
}

impl fmt::Debug for PollSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSession")
            .field("interval", &self.interval)
            .field("deadline", &self.deadline)
            .field("fail_fast", &self.instant_failure.is_some())
            .finish()
    }
}

impl PollSession {
    /// A session that checks every `interval` for at most `deadline`. By
    /// default a 200 counts as ready and nothing fails fast.
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            ready: Box::new(|outcome: &CheckOutcome| outcome.status == 200),
            instant_failure: None,
        }
    }

    pub fn ready_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CheckOutcome) -> bool + Send + Sync + 'static,
    {
        self.ready = Box::new(predicate);
        self
    }

    /// Stops polling with `PollError::Upstream` as soon as an outcome
    /// satisfies `predicate`.
    pub fn fail_fast_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CheckOutcome) -> bool + Send + Sync + 'static,
    {
        self.instant_failure = Some(Box::new(predicate));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn decide(&self, outcome: &CheckOutcome) -> Decision {
        if (self.ready)(outcome) {
            return Decision::Ready;
        }
        match self.instant_failure.as_ref() {
            Some(failed) if failed(outcome) => Decision::Failed,
            _ => Decision::Pending,
        }
    }

    /// Runs `check` until it reports ready, fails fast, or the deadline
    /// passes. The first check runs immediately. A check returning `Err` is
    /// treated as not ready yet.
    pub async fn run<F, Fut, E>(&self, mut check: F) -> Result<PollReport, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CheckOutcome, E>>,
        E: fmt::Display,
    {
        let start = Instant::now();
        let deadline = start + self.deadline;
        let mut checks = 0u32;
        let mut last = None;

        loop {
            let observed = match tokio::time::timeout_at(deadline, check()).await {
                Ok(observed) => observed,
                Err(_) => {
                    debug!(checks, "deadline passed while a check was running");
                    return Err(PollError::Timeout {
                        elapsed: start.elapsed(),
                        checks,
                        last,
                    });
                }
            };
            checks += 1;

            match observed {
                Ok(outcome) => match self.decide(&outcome) {
                    Decision::Ready => {
                        let elapsed = start.elapsed();
                        debug!(checks, ?elapsed, "ready");
                        return Ok(PollReport { checks, elapsed });
                    }
                    Decision::Failed => {
                        debug!(checks, status = outcome.status, "instant failure");
                        return Err(PollError::Upstream {
                            status: outcome.status,
                            body: outcome.body,
                            checks,
                        });
                    }
                    Decision::Pending => {
                        trace!(checks, status = outcome.status, "not ready");
                        last = Some(Observation::Response(outcome));
                    }
                },
                Err(err) => {
                    trace!(checks, error = %err, "check failed");
                    last = Some(Observation::CheckFailed(err.to_string()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed = start.elapsed();
                debug!(checks, ?elapsed, "timed out");
                return Err(PollError::Timeout {
                    elapsed,
                    checks,
                    last,
                });
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}
