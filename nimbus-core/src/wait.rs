//! Wait - Poll a resource until it reaches a target state
//!
//! Long-running cloud operations (instance builds, flavor resizes, deletes)
//! are asynchronous: the API accepts the request and the resource moves
//! through transitional statuses. [`wait_for_state`] repeatedly calls a
//! refresh function until the reported status is in the target set, leaves
//! the pending set, or the deadline passes.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::{Instant, sleep_until};

use crate::provider::{ErrorKind, ProviderError, ProviderResult};

/// Polling interval floor; shorter intervals are raised to this
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of consecutive "not found" observations tolerated
pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

/// Status reported by refresh functions once the remote object is gone
pub const STATUS_DELETED: &str = "DELETED";

/// One observation made by a refresh function
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Current representation; `None` when the object was not found
    pub value: Option<T>,
    /// Status label reported by the cloud
    pub status: String,
}

impl<T> Snapshot<T> {
    pub fn found(value: T, status: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            status: status.into(),
        }
    }

    pub fn missing(status: impl Into<String>) -> Self {
        Self {
            value: None,
            status: status.into(),
        }
    }

    /// The object no longer exists
    pub fn deleted() -> Self {
        Self::missing(STATUS_DELETED)
    }
}

/// What to wait for and for how long
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    /// Transitional statuses; seeing one keeps polling
    pub pending: Vec<String>,
    /// Statuses that end the wait successfully
    pub target: Vec<String>,
    /// Overall deadline, measured from the start of the wait
    pub timeout: Duration,
    /// Sleep before the first poll
    pub delay: Duration,
    /// Sleep between polls
    pub poll_interval: Duration,
    /// Consecutive not-found observations tolerated before failing
    pub not_found_checks: u32,
    /// Consecutive target observations required for success
    pub continuous_target_occurrence: u32,
}

impl WaitSpec {
    pub fn new<P, T, S1, S2>(pending: P, target: T) -> Self
    where
        P: IntoIterator<Item = S1>,
        T: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(600),
            delay: Duration::ZERO,
            poll_interval: Duration::from_secs(5),
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
            continuous_target_occurrence: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrences: u32) -> Self {
        self.continuous_target_occurrence = occurrences;
        self
    }

    /// Check the invariants a wait relies on
    pub fn validate(&self) -> Result<(), WaitError> {
        if self.target.is_empty() {
            return Err(WaitError::InvalidSpec("target states are empty".into()));
        }
        if let Some(overlap) = self.pending.iter().find(|s| self.target.contains(s)) {
            return Err(WaitError::InvalidSpec(format!(
                "state '{}' is both pending and target",
                overlap
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(WaitError::InvalidSpec("poll interval must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(WaitError::InvalidSpec("timeout must be positive".into()));
        }
        Ok(())
    }

    /// Poll interval with the floor applied
    pub fn interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    fn is_target(&self, status: &str) -> bool {
        self.target.iter().any(|s| s == status)
    }

    fn is_pending(&self, status: &str) -> bool {
        self.pending.iter().any(|s| s == status)
    }
}

/// Ways a wait can end without reaching a target state
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("invalid wait specification: {0}")]
    InvalidSpec(String),

    #[error("unexpected state '{state}', wanted target '{}'", target.join(", "))]
    UnexpectedState { state: String, target: Vec<String> },

    #[error(
        "timeout while waiting for state to become '{}' (last state: '{last_state}', timeout: {}s)",
        target.join(", "),
        timeout.as_secs()
    )]
    Timeout {
        last_state: String,
        target: Vec<String>,
        timeout: Duration,
    },

    #[error("couldn't find resource ({checks} retries)")]
    NotFound { checks: u32 },

    #[error(transparent)]
    Refresh(ProviderError),
}

impl From<WaitError> for ProviderError {
    fn from(err: WaitError) -> Self {
        let kind = match err {
            // Refresh failures pass through unchanged
            WaitError::Refresh(inner) => return inner,
            WaitError::InvalidSpec(_) => ErrorKind::Config,
            WaitError::UnexpectedState { .. } => ErrorKind::UnexpectedState,
            WaitError::Timeout { .. } => ErrorKind::Timeout,
            WaitError::NotFound { .. } => ErrorKind::NotFound,
        };
        ProviderError::with_kind(kind, err.to_string())
    }
}

/// Poll `refresh` until the status reaches `spec.target`.
///
/// Returns the representation from the final observation. With no initial
/// delay the first poll happens immediately.
pub async fn wait_for_state<T, F, Fut>(spec: &WaitSpec, mut refresh: F) -> Result<Option<T>, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<Snapshot<T>>>,
{
    spec.validate()?;

    let interval = spec.interval();
    let start = Instant::now();
    let deadline = start + spec.timeout;

    if !spec.delay.is_zero() {
        sleep_until((start + spec.delay).min(deadline)).await;
    }

    let mut last_state = String::new();
    let mut not_found = 0u32;
    let mut target_hits = 0u32;

    loop {
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                last_state,
                target: spec.target.clone(),
                timeout: spec.timeout,
            });
        }

        let snapshot = refresh().await.map_err(WaitError::Refresh)?;
        debug!(
            "waiting for state {:?}, observed '{}' after {:?}",
            spec.target,
            snapshot.status,
            start.elapsed()
        );
        last_state.clone_from(&snapshot.status);

        if spec.is_target(&snapshot.status) {
            target_hits += 1;
            if target_hits >= spec.continuous_target_occurrence {
                return Ok(snapshot.value);
            }
        } else {
            target_hits = 0;
            if snapshot.value.is_none() {
                not_found += 1;
                if not_found > spec.not_found_checks {
                    return Err(WaitError::NotFound { checks: not_found });
                }
            } else {
                not_found = 0;
                if !spec.is_pending(&snapshot.status) {
                    return Err(WaitError::UnexpectedState {
                        state: snapshot.status,
                        target: spec.target.clone(),
                    });
                }
            }
        }

        sleep_until((Instant::now() + interval).min(deadline)).await;
    }
}
