use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{error, warn};

use crate::config::Settings;
use crate::error::FetchError;

const USER_AGENT: &str = concat!("aym_scraper/", env!("CARGO_PKG_VERSION"));

/// Anything that can turn a URL into a document body. Failures come back
/// as an empty string; implementations log them.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = String> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Exponential: `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(
        timeout: Duration,
        retry: RetryPolicy,
        accept_invalid_certs: bool,
    ) -> Result<Self, FetchError> {
        if accept_invalid_certs {
            warn!("TLS certificate verification is disabled");
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(HttpFetcher { client, retry })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, FetchError> {
        Self::new(
            settings.request_timeout(),
            RetryPolicy {
                max_retries: settings.max_retries,
                backoff_base: Duration::from_millis(settings.backoff_base_ms),
            },
            settings.accept_invalid_certs,
        )
    }

    async fn try_fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        Ok(resp.text().await?)
    }

    pub async fn fetch_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.try_fetch(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        "{} failed for {} (attempt {}/{}), backing off {:.1}s",
                        e,
                        url,
                        attempt + 1,
                        self.retry.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> String {
        match self.fetch_with_retry(url).await {
            Ok(body) => body,
            Err(FetchError::Status { status }) => {
                error!("Non-200 response for {}: {}", url, status);
                String::new()
            }
            Err(e) => {
                error!("Error fetching {}: {}", url, e);
                String::new()
            }
        }
    }
}
