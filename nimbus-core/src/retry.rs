//! Retry - Re-attempt mutating calls rejected because the resource is busy
//!
//! Cloud resources reject concurrent mutating calls while a previous
//! operation (resize, backup, attach) is still running. How long that takes
//! is unknown in advance, so instead of a fixed backoff the wrapper polls the
//! resource's own status until it is stable again and only then re-issues
//! the call.
//!
//! # Example
//!
//! ```ignore
//! let operation = Operation::new(OperationKind::Update, id.clone());
//! let stable = WaitSpec::new(["RESIZING", "BACKING_UP"], ["ACTIVE"]);
//! retry_with_wait(
//!     &operation,
//!     &RetryPolicy::default(),
//!     &stable,
//!     || client.resize(&instance_id, &flavor),
//!     || refresh_instance(&client, &instance_id),
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::provider::{ProviderError, ProviderResult};
use crate::resource::ResourceId;
use crate::wait::{Snapshot, WaitError, WaitSpec, wait_for_state};

/// Kind of mutating action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => f.write_str("create"),
            OperationKind::Update => f.write_str("update"),
            OperationKind::Delete => f.write_str("delete"),
        }
    }
}

/// A mutating action against one resource
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub resource: ResourceId,
    /// Job or order id returned by the API once the call was accepted
    pub submitted_id: Option<String>,
}

impl Operation {
    pub fn new(kind: OperationKind, resource: ResourceId) -> Self {
        Self {
            kind,
            resource,
            submitted_id: None,
        }
    }

    pub fn with_submitted_id(mut self, id: impl Into<String>) -> Self {
        self.submitted_id = Some(id.into());
        self
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.resource)?;
        if let Some(ref id) = self.submitted_id {
            write!(f, " (job {})", id)?;
        }
        Ok(())
    }
}

/// Decides whether an error means "busy, try again later"
pub type ErrorClassifier = fn(&ProviderError) -> bool;

/// How long and how often to re-attempt
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wall-clock bound for all attempts and waits together
    pub timeout: Duration,
    /// Optional bound on attempts; `None` relies on the timeout alone
    pub max_attempts: Option<u32>,
    pub is_retryable: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            max_attempts: None,
            is_retryable: ProviderError::is_conflict,
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.is_retryable = classifier;
        self
    }
}

/// Run `attempt`; whenever it fails with a retryable error, wait via
/// `refresh` until the resource reaches one of `stable.target` and try again.
///
/// Non-retryable errors are returned as-is. A retryable error that outlasts
/// `policy.timeout` becomes a timeout error caused by the last failure.
pub async fn retry_with_wait<T, S, A, AFut, R, RFut>(
    operation: &Operation,
    policy: &RetryPolicy,
    stable: &WaitSpec,
    mut attempt: A,
    mut refresh: R,
) -> ProviderResult<T>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = ProviderResult<T>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = ProviderResult<Snapshot<S>>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    info!("{} succeeded after {} attempts", operation, attempts);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !(policy.is_retryable)(&err) {
            return Err(err);
        }

        if let Some(max) = policy.max_attempts
            && attempts >= max
        {
            return Err(err.context(format!("{} gave up after {} attempts", operation, attempts)));
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(timed_out(operation, policy, err));
        }

        warn!(
            "{} rejected while the resource is busy, waiting for {:?}: {}",
            operation, stable.target, err
        );

        // The status can read stable before the API stops reporting busy,
        // so every re-attempt is at least one poll interval apart
        let mut wait = stable.clone();
        wait.timeout = wait.timeout.min(deadline - now);
        wait.delay = wait.delay.max(wait.interval());
        match wait_for_state(&wait, &mut refresh).await {
            Ok(_) => {}
            Err(WaitError::Timeout { .. }) if Instant::now() >= deadline => {
                return Err(timed_out(operation, policy, err));
            }
            Err(wait_err) => return Err(wait_err.into()),
        }
    }
}

fn timed_out(operation: &Operation, policy: &RetryPolicy, last: ProviderError) -> ProviderError {
    let resource = last.resource_id.clone();
    let mut err = ProviderError::timeout(format!(
        "timeout after {}s retrying {}",
        policy.timeout.as_secs(),
        operation
    ))
    .with_cause(last);
    err.resource_id = resource;
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn operation() -> Operation {
        Operation::new(OperationKind::Update, ResourceId::new("rds_instance", "db"))
    }

    fn stable() -> WaitSpec {
        WaitSpec::new(["RESIZING"], ["ACTIVE"])
            .with_poll_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_once_then_success_takes_two_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result = retry_with_wait(
            &operation(),
            &RetryPolicy::default(),
            &stable(),
            || {
                let n = a.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProviderError::conflict("another operation in progress"))
                    } else {
                        Ok("resized")
                    }
                }
            },
            || async { Ok(Snapshot::found((), "ACTIVE")) },
        )
        .await;

        assert_eq!(result.unwrap(), "resized");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returned_after_one_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();

        let result: ProviderResult<()> = retry_with_wait(
            &operation(),
            &RetryPolicy::default(),
            &stable(),
            || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::new("flavor not available")) }
            },
            || {
                p.fetch_add(1, Ordering::SeqCst);
                async { Ok(Snapshot::found((), "ACTIVE")) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(err.message, "flavor not available");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_stable_state_before_reattempting() {
        let mut statuses = vec!["RESIZING", "RESIZING", "ACTIVE"].into_iter();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let start = Instant::now();

        let result = retry_with_wait(
            &operation(),
            &RetryPolicy::default(),
            &stable(),
            || {
                let n = a.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ProviderError::conflict("busy"))
                    } else {
                        Ok(())
                    }
                }
            },
            || {
                let status = statuses.next().unwrap_or("ACTIVE");
                async move { Ok(Snapshot::found((), status)) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // One interval before the first poll, then two more polls
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_conflict_times_out_with_last_error() {
        let policy = RetryPolicy::with_timeout(Duration::from_secs(10));
        let start = Instant::now();

        let result: ProviderResult<()> = retry_with_wait(
            &operation(),
            &policy,
            &stable(),
            || async { Err(ProviderError::conflict("DBS.200019: instance busy")) },
            || async { Ok(Snapshot::found((), "RESIZING")) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("DBS.200019: instance busy"));
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_while_stable_reattempts_once_per_interval() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let policy = RetryPolicy::with_timeout(Duration::from_secs(10));
        let start = Instant::now();

        let result: ProviderResult<()> = retry_with_wait(
            &operation(),
            &policy,
            &stable(),
            || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::conflict("DBS.200019: instance busy")) }
            },
            || async { Ok(Snapshot::found((), "ACTIVE")) },
        )
        .await;

        assert!(result.unwrap_err().is_timeout());
        // Attempts at 0s, 1s, ..., 9s
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_state_during_wait_propagates() {
        let result: ProviderResult<()> = retry_with_wait(
            &operation(),
            &RetryPolicy::default(),
            &stable(),
            || async { Err(ProviderError::conflict("busy")) },
            || async { Ok(Snapshot::found((), "FAILED")) },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::UnexpectedState);
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_bounds_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let policy = RetryPolicy::default().with_max_attempts(3);

        let result: ProviderResult<()> = retry_with_wait(
            &operation(),
            &policy,
            &stable(),
            || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::conflict("busy")) }
            },
            || async { Ok(Snapshot::found((), "ACTIVE")) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier() {
        fn transport_is_retryable(err: &ProviderError) -> bool {
            err.kind == ErrorKind::Transport
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let policy = RetryPolicy::default().with_classifier(transport_is_retryable);

        let result = retry_with_wait(
            &operation(),
            &policy,
            &stable(),
            || {
                let n = a.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ProviderError::with_kind(ErrorKind::Transport, "reset"))
                    } else {
                        Ok(n)
                    }
                }
            },
            || async { Ok(Snapshot::found((), "ACTIVE")) },
        )
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn operation_display() {
        let op = Operation::new(OperationKind::Delete, ResourceId::new("compute_instance", "web"))
            .with_submitted_id("job-42");
        assert_eq!(op.to_string(), "delete compute_instance.web (job job-42)");
    }
}
