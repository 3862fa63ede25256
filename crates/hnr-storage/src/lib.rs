//! Persistence gateway + HTTP fetch utilities for the HN reader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, Instrument};
use uuid::Uuid;

mod gateway;
mod memory;
mod postgres;

pub use gateway::{PostStore, StoreError};
pub use memory::MemoryPostStore;
pub use postgres::PgPostStore;

pub const CRATE_NAME: &str = "hnr-storage";

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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Semaphore-bounded dispatcher that also enforces a minimum interval between
/// consecutive dispatches. Timing runs on `tokio::time`, so a paused test
/// runtime drives it deterministically.
#[derive(Debug)]
pub struct DispatchLimiter {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

#[derive(Debug)]
pub struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
}

impl DispatchLimiter {
    pub fn new(max_in_flight: usize, min_interval: Duration) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits for a free slot and for this dispatch's turn in the interval schedule.
    pub async fn acquire(&self) -> DispatchPermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");

        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;

        DispatchPermit { _permit: permit }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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

    /// GET with retries on transient failures.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = tracing::info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Single-attempt JSON POST, used for outbound notifications.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        source_id: &str,
        url: &str,
        bearer_token: Option<&str>,
        body: &T,
    ) -> Result<StatusCode, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_until_five_seconds() {
        let backoff = HttpClientConfig::default().backoff;
        let delays = (0..7)
            .map(|attempt| backoff.delay_for_attempt(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![250, 500, 1_000, 2_000, 4_000, 5_000, 5_000]);
        // Shift overflow saturates instead of wrapping back to a short delay.
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn only_upstream_trouble_is_worth_retrying() {
        let cases = [
            (StatusCode::SERVICE_UNAVAILABLE, RetryDisposition::Retryable),
            (StatusCode::GATEWAY_TIMEOUT, RetryDisposition::Retryable),
            (StatusCode::TOO_MANY_REQUESTS, RetryDisposition::Retryable),
            (StatusCode::UNAUTHORIZED, RetryDisposition::NonRetryable),
            (StatusCode::NOT_FOUND, RetryDisposition::NonRetryable),
            (StatusCode::OK, RetryDisposition::NonRetryable),
        ];
        for (status, expected) in cases {
            assert_eq!(classify_status(status), expected, "{status}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_spaced_by_min_interval() {
        let limiter = DispatchLimiter::new(8, Duration::from_millis(100));
        let start = Instant::now();

        let mut stamps = Vec::new();
        for _ in 0..3 {
            let _permit = limiter.acquire().await;
            stamps.push(start.elapsed());
        }

        assert_eq!(stamps[0], Duration::ZERO);
        assert!(stamps[1] >= Duration::from_millis(100));
        assert!(stamps[2] >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_dispatches_are_bounded() {
        let limiter = Arc::new(DispatchLimiter::new(2, Duration::ZERO));
        let first = limiter.acquire().await;
        let _second = limiter.acquire().await;

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _third = limiter.acquire().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }
}
