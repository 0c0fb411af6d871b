//! Resilient execution of owner requests.
//!
//! The [`Executor`] turns one logical request into up to [`MAX_ATTEMPTS`] attempts against a
//! [`Remote`](crate::remote::Remote), waiting with exponential backoff and random jitter between
//! attempts so that workers failing at the same moment do not retry in lockstep. It always
//! returns the last response it observed; deciding whether a failed final outcome matters is up
//! to the caller.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::entity::Owner;
use crate::metrics::{self, ErrorSample, Metrics, RequestRecord};
use crate::pool::OwnerId;
use crate::remote::{Endpoint, Method, Request, SharedRemote};

/// Hard ceiling of attempts per logical request.
pub const MAX_ATTEMPTS: u32 = 3;

/// Which failed outcomes are worth another attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Transport errors, `429` and `5xx`. Other `4xx` fail immediately.
    #[default]
    Transient,
    /// Every non-`2xx` outcome.
    Any,
}

/// Retry and backoff settings.
///
/// The wait before attempt `n + 1` is `base * 2^n + jitter`, with jitter drawn uniformly from
/// `[0, jitter)`. As long as `jitter <= base` every wait is strictly longer than the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per logical request, between `1` and [`MAX_ATTEMPTS`].
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base: Duration::from_millis(100),
            jitter: Duration::from_millis(100),
            retry_on: RetryOn::Transient,
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if an attempt ending with `status` should be repeated.
    pub fn should_retry(&self, status: Option<u16>) -> bool {
        match (self.retry_on, status) {
            (_, Some(200..=299)) => false,
            (RetryOn::Any, _) => true,
            (RetryOn::Transient, None | Some(429) | Some(500..)) => true,
            (RetryOn::Transient, Some(_)) => false,
        }
    }

    /// The wait after the failed attempt with zero-based index `attempt`.
    pub fn backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(rng.random::<f64>())
        };
        self.base * 2u32.saturating_pow(attempt) + jitter
    }
}

/// The last observed outcome of a logical request.
#[derive(Clone, Debug)]
pub struct Response {
    pub endpoint: Endpoint,
    /// Final status, `None` if no attempt reached the remote.
    pub status: Option<u16>,
    pub body: Bytes,
    pub request_id: Option<String>,
    /// Latency of the final attempt.
    pub latency: Duration,
    pub attempts: u32,
}

impl Response {
    pub fn is_success(&self) -> bool {
        metrics::is_success(self.status)
    }

    /// The owner id of a successful write, if the body carries one.
    pub fn owner_id(&self) -> Option<OwnerId> {
        if !self.is_success() {
            return None;
        }
        OwnerId::from_response(&self.body)
    }
}

/// Sends owner requests with retries and records their metrics.
#[derive(Clone, Debug)]
pub struct Executor {
    remote: SharedRemote,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
}

impl Executor {
    pub fn new(remote: SharedRemote, metrics: Arc<Metrics>, policy: RetryPolicy) -> Self {
        Self {
            remote,
            metrics,
            policy,
        }
    }

    /// A copy of this executor that records into different metrics.
    pub fn with_metrics(&self, metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            ..self.clone()
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// `GET /owners`
    pub async fn list(&self) -> Response {
        self.execute(Endpoint::ListOwners, "/owners".into(), None)
            .await
    }

    /// `GET /owners/{id}`
    pub async fn get(&self, id: &OwnerId) -> Response {
        self.execute(Endpoint::GetOwner, format!("/owners/{id}"), None)
            .await
    }

    /// `POST /owners`
    pub async fn create(&self, owner: &Owner) -> Response {
        self.execute(Endpoint::CreateOwner, "/owners".into(), Some(owner))
            .await
    }

    /// `PUT /owners/{id}`
    pub async fn update(&self, id: &OwnerId, owner: &Owner) -> Response {
        self.execute(Endpoint::UpdateOwner, format!("/owners/{id}"), Some(owner))
            .await
    }

    /// `DELETE /owners/{id}`
    pub async fn delete(&self, id: &OwnerId) -> Response {
        self.execute(Endpoint::DeleteOwner, format!("/owners/{id}"), None)
            .await
    }

    /// Sends one logical request, retrying failed attempts according to the [`RetryPolicy`].
    pub async fn execute(&self, endpoint: Endpoint, path: String, body: Option<&Owner>) -> Response {
        let method = endpoint.method();
        let body = body.map(|owner| match serde_json::to_vec(owner) {
            Ok(json) => Bytes::from(json),
            // Serializing plain strings cannot fail.
            Err(_) => Bytes::new(),
        });
        let request = Request { method, path, body };

        let max_attempts = self.policy.max_attempts.clamp(1, MAX_ATTEMPTS);
        let mut attempt = 0;
        let (response, latency) = loop {
            let start = Instant::now();
            let result = self.remote.send(&request).await;
            let latency = start.elapsed();
            attempt += 1;

            let status = result.as_ref().ok().map(|r| r.status);
            if attempt >= max_attempts || !self.policy.should_retry(status) {
                break (result, latency);
            }

            match &result {
                Ok(response) => tracing::trace!(
                    %method, path = %request.path, status = response.status, attempt, "retrying request"
                ),
                Err(err) => tracing::trace!(
                    %method, path = %request.path, error = err as &dyn std::error::Error, attempt, "retrying request"
                ),
            }
            self.metrics.record_retry();

            let wait = self.policy.backoff(attempt - 1, &mut rand::rng());
            tokio::time::sleep(wait).await;
        };

        let response = match response {
            Ok(raw) => Response {
                endpoint,
                status: Some(raw.status),
                body: raw.body,
                request_id: raw.request_id,
                latency,
                attempts: attempt,
            },
            Err(err) => {
                tracing::debug!(
                    %method, path = %request.path, error = &err as &dyn std::error::Error, "request failed"
                );
                Response {
                    endpoint,
                    status: None,
                    body: Bytes::from(err.to_string()),
                    request_id: None,
                    latency,
                    attempts: attempt,
                }
            }
        };

        self.metrics.record(&RequestRecord {
            endpoint,
            status: response.status,
            latency: response.latency,
            attempts: response.attempts,
            bytes: response.body.len() as u64,
        });

        if !response.is_success() {
            tracing::debug!(%method, path = %request.path, status = ?response.status, "[ERR]");
            self.metrics.sample_error(|| {
                ErrorSample::new(
                    method,
                    request.path.as_str(),
                    response.status,
                    response.request_id.clone(),
                    &String::from_utf8_lossy(&response.body),
                )
            });
        }

        response
    }
}
