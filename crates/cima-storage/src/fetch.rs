//! Retrying HTTP GET for attachment bytes.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Source of attachment bytes. [`HttpFetcher`] is the production implementation.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    GiveUp,
}

impl RetryDisposition {
    /// Rate limiting and server-side failures are transient.
    pub fn for_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            RetryDisposition::Retry
        } else {
            RetryDisposition::GiveUp
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            RetryDisposition::Retry
        } else {
            RetryDisposition::GiveUp
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (0-based). A server-provided `Retry-After`
    /// replaces the exponential delay; both are capped at `max_delay`.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry));
        retry_after.unwrap_or(exponential).min(self.max_delay)
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building attachment http client")?,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0;
        loop {
            let (disposition, hint, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.bytes().await?.to_vec()),
                Ok(resp) => {
                    let status = resp.status();
                    (
                        RetryDisposition::for_status(status),
                        retry_after(&resp),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        },
                    )
                }
                Err(err) => (RetryDisposition::for_error(&err), None, FetchError::Request(err)),
            };

            if disposition == RetryDisposition::GiveUp || retry >= self.backoff.max_retries {
                return Err(err);
            }
            let wait = self.backoff.delay(retry, hint);
            debug!(retry, wait_ms = wait.as_millis() as u64, error = %err, "retrying attachment fetch");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}

#[async_trait]
impl BlobSource for HttpFetcher {
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // Signed attachment URLs are long; keep them out of the span.
        self.fetch_bytes(url)
            .instrument(info_span!("attachment_fetch"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay(40, None), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_overrides_but_stays_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(policy.delay(0, Some(Duration::from_secs(30))), Duration::from_secs(5));
    }

    #[test]
    fn transient_statuses_are_retried() {
        assert_eq!(
            RetryDisposition::for_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retry
        );
        assert_eq!(
            RetryDisposition::for_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retry
        );
        assert_eq!(
            RetryDisposition::for_status(StatusCode::FORBIDDEN),
            RetryDisposition::GiveUp
        );
    }
}
