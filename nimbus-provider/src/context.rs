//! Provider context - Everything handlers need, built once per run

use std::time::Duration;

use nimbus_core::retry::RetryPolicy;
use nimbus_core::wait::WaitSpec;
use nimbus_sdk::ApiClient;
use nimbus_sdk::jobs::job_wait_spec;

/// Default time allowed for each kind of operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeouts {
    pub create: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(30 * 60),
            update: Duration::from_secs(30 * 60),
            delete: Duration::from_secs(20 * 60),
        }
    }
}

/// Immutable after construction and passed to every handler call
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub client: ApiClient,
    pub timeouts: Timeouts,
    /// Wait before the first status poll
    pub poll_delay: Duration,
    pub poll_interval: Duration,
}

impl ProviderContext {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            timeouts: Timeouts::default(),
            poll_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_polling(mut self, delay: Duration, interval: Duration) -> Self {
        self.poll_delay = delay;
        self.poll_interval = interval;
        self
    }

    pub fn project_id(&self) -> &str {
        self.client.project_id()
    }

    pub fn region(&self) -> &str {
        self.client.region()
    }

    /// Full URL of a project-scoped path: `/{version}/{project}{path}`
    pub fn url(&self, service: &str, version: &str, path: &str) -> String {
        self.client
            .url(service, &format!("/{}/{}{}", version, self.project_id(), path))
    }

    /// Status wait using this context's polling cadence
    pub fn wait_spec(&self, pending: &[&str], target: &[&str], timeout: Duration) -> WaitSpec {
        WaitSpec::new(pending.iter().copied(), target.iter().copied())
            .with_timeout(timeout)
            .with_delay(self.poll_delay)
            .with_poll_interval(self.poll_interval)
    }

    pub fn job_spec(&self, timeout: Duration) -> WaitSpec {
        job_wait_spec(timeout).with_delay(self.poll_delay)
    }

    pub fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::with_timeout(timeout)
    }
}
