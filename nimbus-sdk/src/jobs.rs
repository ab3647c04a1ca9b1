//! Jobs - Track asynchronous jobs returned by compute and database APIs
//!
//! Long-running calls answer with a `job_id` instead of the finished
//! resource. The job is polled until it leaves `INIT`/`RUNNING`.

use std::time::Duration;

use log::debug;
use nimbus_core::provider::{ErrorKind, ProviderError, ProviderResult};
use nimbus_core::wait::{Snapshot, WaitSpec, wait_for_state};
use serde::Deserialize;

use crate::client::ApiClient;

pub const JOB_PENDING: &[&str] = &["INIT", "RUNNING"];
pub const JOB_SUCCESS: &str = "SUCCESS";
pub const JOB_FAIL: &str = "FAIL";

/// Response of an API call that started a job
#[derive(Debug, Clone, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub job_type: Option<String>,
    pub status: String,
    #[serde(default)]
    pub entities: JobEntities,
    #[serde(default)]
    pub fail_reason: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobEntities {
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub sub_jobs: Vec<SubJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubJob {
    pub status: String,
    #[serde(default)]
    pub entities: SubJobEntities,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubJobEntities {
    #[serde(default)]
    pub server_id: Option<String>,
}

impl Job {
    /// Id of the resource the job created: the top-level entity, or the
    /// first sub-job's server
    pub fn resource_id(&self) -> Option<&str> {
        self.entities
            .server_id
            .as_deref()
            .or(self.entities.instance_id.as_deref())
            .or_else(|| {
                self.entities
                    .sub_jobs
                    .iter()
                    .find_map(|sub| sub.entities.server_id.as_deref())
            })
    }
}

/// URL of a job on `service`
pub fn job_url(client: &ApiClient, service: &str, job_id: &str) -> String {
    client.url(service, &format!("/v1/{}/jobs/{}", client.project_id(), job_id))
}

/// One observation of a job, for use as a poller refresh function
pub async fn refresh_job(client: &ApiClient, service: &str, job_id: &str) -> ProviderResult<Snapshot<Job>> {
    match client.get_json::<Job>(&job_url(client, service, job_id)).await {
        Ok(job) => {
            let status = job.status.clone();
            Ok(Snapshot::found(job, status))
        }
        Err(err) if err.is_not_found() => Ok(Snapshot::missing("NOT_FOUND")),
        Err(err) => Err(err.into()),
    }
}

/// How jobs are polled: a short delay, then every 10s until `timeout`
pub fn job_wait_spec(timeout: Duration) -> WaitSpec {
    WaitSpec::new(JOB_PENDING.iter().copied(), [JOB_SUCCESS, JOB_FAIL])
        .with_timeout(timeout)
        .with_delay(Duration::from_secs(5))
        .with_poll_interval(Duration::from_secs(10))
}

/// Wait until the job finishes. A failed job becomes an
/// [`ErrorKind::UnexpectedState`] error carrying its failure reason.
pub async fn wait_for_job(
    client: &ApiClient,
    service: &str,
    job_id: &str,
    spec: &WaitSpec,
) -> ProviderResult<Job> {
    let job = wait_for_state(spec, || refresh_job(client, service, job_id))
        .await?
        .ok_or_else(|| ProviderError::not_found(format!("job {} not found", job_id)))?;

    debug!("job {} finished with {}", job_id, job.status);
    if job.status == JOB_FAIL {
        let reason = job
            .fail_reason
            .clone()
            .or_else(|| job.error_code.clone())
            .unwrap_or_else(|| "no reason given".to_string());
        return Err(ProviderError::with_kind(
            ErrorKind::UnexpectedState,
            format!("job {} failed: {}", job_id, reason),
        ));
    }
    Ok(job)
}
