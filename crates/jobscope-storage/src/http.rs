use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts are terminal: a page that did not answer in time is abandoned, not retried.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Randomized delay bounds between requests; the inter-source pause is a multiple of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub source_delay_multiplier: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            source_delay_multiplier: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestPacer {
    config: PacingConfig,
}

impl RequestPacer {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    /// No waiting at all; used by offline fixture runs and tests.
    pub fn disabled() -> Self {
        Self::new(PacingConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            source_delay_multiplier: 0,
        })
    }

    pub fn config(&self) -> PacingConfig {
        self.config
    }

    pub fn next_delay(&self) -> Duration {
        let lo = self.config.min_delay.min(self.config.max_delay).as_millis() as u64;
        let hi = self.config.min_delay.max(self.config.max_delay).as_millis() as u64;
        if hi == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    pub fn next_source_delay(&self) -> Duration {
        self.next_delay()
            .saturating_mul(self.config.source_delay_multiplier)
    }

    pub async fn pause(&self) {
        sleep_unless_zero(self.next_delay()).await;
    }

    pub async fn pause_between_sources(&self) {
        sleep_unless_zero(self.next_source_delay()).await;
    }
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        debug!(delay_ms = delay.as_millis() as u64, "pacing");
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 4,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request timed out: {url}")]
    Timeout { url: String },
}

/// Cookie-keeping HTTP client with global and per-source concurrency limits.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url, method = "GET");
        self.send_with_retry(source_id, url, || self.client.get(url))
            .instrument(span)
            .await
    }

    pub async fn post_form(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url, method = "POST");
        self.send_with_retry(source_id, url, || self.client.post(url).form(form))
            .instrument(span)
            .await
    }

    async fn send_with_retry<F>(
        &self,
        source_id: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedPage, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await.map_err(|err| timeout_or(err, url))?;
                        return Ok(FetchedPage {
                            status: status.as_u16(),
                            final_url,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(timeout_or(err, url));
                }
            }
        }
    }
}

fn timeout_or(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn pacer_delays_stay_within_bounds() {
        let pacer = RequestPacer::new(PacingConfig {
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
            source_delay_multiplier: 5,
        });
        for _ in 0..50 {
            let delay = pacer.next_delay();
            assert!(delay >= Duration::from_millis(20) && delay <= Duration::from_millis(40));
            let source_delay = pacer.next_source_delay();
            assert!(source_delay >= Duration::from_millis(100));
            assert!(source_delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn disabled_pacer_never_waits() {
        let pacer = RequestPacer::disabled();
        assert_eq!(pacer.next_delay(), Duration::ZERO);
        assert_eq!(pacer.next_source_delay(), Duration::ZERO);
    }

    #[test]
    fn inverted_bounds_are_tolerated() {
        let pacer = RequestPacer::new(PacingConfig {
            min_delay: Duration::from_millis(30),
            max_delay: Duration::from_millis(10),
            source_delay_multiplier: 1,
        });
        let delay = pacer.next_delay();
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(30));
    }
}
