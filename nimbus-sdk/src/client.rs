//! Client - Signed JSON HTTP client shared by every resource handler
//!
//! Requests are signed per attempt, so a retried request carries a fresh
//! `X-Sdk-Date`. Throttling and gateway errors are retried here with
//! exponential backoff; everything else is returned to the caller as
//! [`SdkError::Api`].

use std::time::Duration;

use log::{debug, warn};
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use url::Url;

use crate::endpoints::Endpoints;
use crate::error::{Result, SdkError};
use crate::signer::{self, Credentials, HEADER_AUTHORIZATION, HEADER_HOST, Payload, SigningRequest};

pub const HEADER_PROJECT_ID: &str = "X-Project-Id";

/// Status codes retried at the transport level
const RETRYABLE_STATUS: &[u16] = &[429, 502, 503, 504];
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Everything needed to talk to the APIs of one project
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    pub project_id: String,
    pub endpoints: Endpoints,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(credentials: Credentials, project_id: impl Into<String>, endpoints: Endpoints) -> Self {
        Self {
            credentials,
            project_id: project_id.into(),
            endpoints,
            max_retries: 5,
            retry_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Signed API client. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| SdkError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { http, config })
    }

    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    pub fn region(&self) -> &str {
        self.config.endpoints.region()
    }

    /// Full URL of `path` on `service`
    pub fn url(&self, service: &str, path: &str) -> String {
        format!("{}{}", self.config.endpoints.url(service), path)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let value = self.send(Method::GET, url, None).await?;
        decode(url, value)
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let value = self.send(Method::POST, url, Some(encode(url, body)?)).await?;
        decode(url, value)
    }

    pub async fn put_json<B, T>(&self, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let value = self.send(Method::PUT, url, Some(encode(url, body)?)).await?;
        decode(url, value)
    }

    /// DELETE, returning the response body (`Null` when empty)
    pub async fn delete(&self, url: &str) -> Result<JsonValue> {
        self.send(Method::DELETE, url, None).await
    }

    async fn send(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> Result<JsonValue> {
        let parsed = Url::parse(url)?;
        let mut retries = 0u32;

        loop {
            let mut request = SigningRequest::new(method.as_str(), parsed.clone())
                .with_header(HEADER_PROJECT_ID, self.config.project_id.as_str());
            if body.is_some() {
                request = request.with_header("Content-Type", "application/json;charset=UTF-8");
            }
            signer::sign(
                &mut request,
                Payload::Bytes(body.as_deref().unwrap_or_default()),
                &self.config.credentials,
            )?;
            debug!("{} {} headers={:?}", method, url, redacted(&request.headers));

            let mut builder = self.http.request(method.clone(), parsed.clone());
            for (name, value) in &request.headers {
                // reqwest derives Host from the URL
                if name.eq_ignore_ascii_case(HEADER_HOST) {
                    continue;
                }
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(ref bytes) = body {
                builder = builder.body(bytes.clone());
            }

            let response = builder.send().await.map_err(|source| SdkError::Transport {
                url: url.to_string(),
                source,
            })?;
            let status = response.status().as_u16();
            let text = response.text().await.map_err(|source| SdkError::Transport {
                url: url.to_string(),
                source,
            })?;

            if (200..300).contains(&status) {
                if text.trim().is_empty() {
                    return Ok(JsonValue::Null);
                }
                return serde_json::from_str(&text).map_err(|source| SdkError::Decode {
                    url: url.to_string(),
                    source,
                });
            }

            if RETRYABLE_STATUS.contains(&status) && retries < self.config.max_retries {
                let delay = self.backoff(retries);
                retries += 1;
                warn!(
                    "{} {} returned {}, retrying in {:?} ({}/{})",
                    method, url, status, delay, retries, self.config.max_retries
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            debug!("{} {} failed with {}: {}", method, url, status, text);
            return Err(SdkError::from_response(status, text));
        }
    }

    fn backoff(&self, retries: u32) -> Duration {
        self.config
            .retry_backoff
            .saturating_mul(1u32 << retries.min(16))
            .min(MAX_BACKOFF)
    }
}

fn encode<B: Serialize + ?Sized>(url: &str, body: &B) -> Result<Vec<u8>> {
    serde_json::to_vec(body).map_err(|source| SdkError::Decode {
        url: url.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(url: &str, value: JsonValue) -> Result<T> {
    serde_json::from_value(value).map_err(|source| SdkError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Headers safe to log
fn redacted(headers: &[(String, String)]) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(name, value)| {
            if name.eq_ignore_ascii_case(HEADER_AUTHORIZATION)
                || name.eq_ignore_ascii_case(signer::HEADER_SECURITY_TOKEN)
            {
                (name.as_str(), "***")
            } else {
                (name.as_str(), value.as_str())
            }
        })
        .collect()
}
