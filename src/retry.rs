use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorClass, RewriteError};

static RETRY_IN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry in\s+([0-9]+(?:\.[0-9]+)?)\s*s").expect("retry-in regex"));
static RETRY_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)retry_delay\s*\{\s*seconds:\s*([0-9]+)").expect("retry_delay regex")
});

/// Upper bound on a provider-suggested wait.
pub const MAX_SUGGESTED_WAIT: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, pause: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            pause,
        }
    }

    /// Wait before the next attempt: provider-suggested wait (if any, capped at
    /// [`MAX_SUGGESTED_WAIT`]) plus the fixed pause.
    pub fn wait_after(&self, suggested: Option<f64>) -> Duration {
        match suggested {
            Some(s) if s.is_finite() => {
                let hint = Duration::try_from_secs_f64(s.max(0.0)).unwrap_or(MAX_SUGGESTED_WAIT);
                if hint > MAX_SUGGESTED_WAIT {
                    log::warn!("provider asked to wait {s}s; capping at {}s", MAX_SUGGESTED_WAIT.as_secs());
                }
                hint.min(MAX_SUGGESTED_WAIT).saturating_add(self.pause)
            }
            _ => self.pause,
        }
    }
}

/// Best-effort provider wait hint in seconds, e.g. `retry in 17s` or
/// `retry_delay { seconds: 17 }`.
pub fn parse_suggested_wait(message: &str) -> Option<f64> {
    [&*RETRY_IN_RE, &*RETRY_DELAY_RE].iter().find_map(|re| {
        re.captures(message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting,
    Retrying,
    Success,
    Failed,
}

/// One failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub class: ErrorClass,
    pub suggested_wait: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct RetryOutcome {
    pub result: Result<String, RewriteError>,
    pub state: RetryState,
    pub calls: u32,
    pub failures: Vec<RetryAttempt>,
    pub waits: Vec<Duration>,
}

/// Drive `call` until it returns non-blank text, a non-retryable error, or the attempt cap.
///
/// `call` receives the 1-based attempt number. `sleep` is invoked with every computed wait.
pub fn run_with_retry<S, C>(policy: &RetryPolicy, mut sleep: S, mut call: C) -> RetryOutcome
where
    S: FnMut(Duration),
    C: FnMut(u32) -> Result<String, RewriteError>,
{
    let mut state = RetryState::Idle;
    let mut failures = Vec::new();
    let mut waits = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        state = transition(state, RetryState::Attempting);
        let err = match call(attempt) {
            Ok(text) if !text.trim().is_empty() => {
                state = transition(state, RetryState::Success);
                return RetryOutcome {
                    result: Ok(text),
                    state,
                    calls: attempt,
                    failures,
                    waits,
                };
            }
            Ok(_) => RewriteError::EmptyResponse,
            Err(err) => err,
        };

        let suggested = match err {
            RewriteError::RateLimit(ref msg) => parse_suggested_wait(msg),
            _ => None,
        };
        failures.push(RetryAttempt {
            attempt,
            class: err.class(),
            suggested_wait: suggested,
        });

        if !err.is_retryable() || attempt >= policy.max_attempts {
            if err.is_retryable() {
                log::warn!("giving up after {attempt} attempts: {err}");
            } else {
                log::warn!("not retrying {} error: {err}", err.class().as_str());
            }
            state = transition(state, RetryState::Failed);
            return RetryOutcome {
                result: Err(err),
                state,
                calls: attempt,
                failures,
                waits,
            };
        }

        state = transition(state, RetryState::Retrying);
        let wait = policy.wait_after(suggested);
        log::warn!(
            "attempt {attempt}/{} failed ({}); retrying in {:.1}s",
            policy.max_attempts,
            err.class().as_str(),
            wait.as_secs_f64()
        );
        waits.push(wait);
        sleep(wait);
    }
}

fn transition(from: RetryState, to: RetryState) -> RetryState {
    log::trace!("retry state {from:?} -> {to:?}");
    to
}
