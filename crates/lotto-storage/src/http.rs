//! Single-attempt HTTP fetching with failure classification and backoff policy.
//!
//! Retrying is owned by the caller (see `lotto-adapters`), which is the only
//! layer that knows whether a failure is transient for its source.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff with jitter and a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Delay scaled into `[delay/2, delay]` by `unit`, which must lie in `[0, 1]`.
    pub fn jittered_delay(&self, attempt_index: usize, unit: f64) -> Duration {
        let ceiling = self.delay_for_attempt(attempt_index);
        let unit = unit.clamp(0.0, 1.0);
        ceiling.mul_f64(0.5 + unit * 0.5)
    }

    /// Delay for the next attempt with fresh random jitter.
    pub fn sample_delay(&self, attempt_index: usize) -> Duration {
        let entropy = (Uuid::new_v4().as_u128() % 10_000) as f64 / 10_000.0;
        self.jittered_delay(attempt_index, entropy)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        disposition: RetryDisposition,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status {
        status: u16,
        url: String,
        disposition: RetryDisposition,
        body: Vec<u8>,
    },
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { disposition, .. } | Self::Status { disposition, .. } => *disposition,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request { .. } => None,
        }
    }

    /// Body of a non-success response, kept for raw capture.
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            Self::Status { body, .. } => Some(body),
            Self::Request { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// One GET attempt, bounded by the client timeout.
    pub async fn get(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        debug!(url, "http get");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| HttpError::Request {
                url: url.to_string(),
                disposition: classify_reqwest_error(&source),
                source,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|source| HttpError::Request {
                url: final_url.clone(),
                disposition: classify_reqwest_error(&source),
                source,
            })?
            .to_vec();

        if status.is_success() {
            return Ok(FetchedResponse {
                status,
                final_url,
                body,
            });
        }

        Err(HttpError::Status {
            status: status.as_u16(),
            url: final_url,
            disposition: classify_status(status),
            body,
        })
    }
}
