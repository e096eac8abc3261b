//! HTTP access to card-data APIs.
//!
//! Each provider gets its own gate: a concurrency limit plus a minimum spacing
//! between request starts. A process-wide limit caps the total in flight.
//! Throttling (429/503) and 5xx responses are retried with exponential backoff,
//! or after the server's `Retry-After` when it sends one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    GiveUp,
    /// Retry; carries the server's own delay when it named one.
    Retry(Option<Duration>),
}

pub fn decide_for_status(status: StatusCode, retry_after: Option<&str>) -> RetryDecision {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            RetryDecision::Retry(retry_after.and_then(parse_retry_after))
        }
        StatusCode::REQUEST_TIMEOUT => RetryDecision::Retry(None),
        s if s.is_server_error() => RetryDecision::Retry(None),
        _ => RetryDecision::GiveUp,
    }
}

pub fn decide_for_error(err: &reqwest::Error) -> RetryDecision {
    if err.is_timeout() || err.is_connect() {
        RetryDecision::Retry(None)
    } else {
        RetryDecision::GiveUp
    }
}

/// Delay-seconds form only. HTTP-date values fall back to the backoff schedule.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a server-requested `Retry-After`.
    pub max_server_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_server_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    /// `initial_delay * 2^retry`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn wait_before_retry(&self, retry: usize, server_hint: Option<Duration>) -> Duration {
        match server_hint {
            Some(hint) => hint.min(self.max_server_delay),
            None => self.delay_for_retry(retry),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub per_provider_in_flight: usize,
    /// Minimum spacing between request starts to one provider.
    pub min_request_interval: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        // Card-data APIs answer 429 below roughly one call every three seconds.
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 4,
            per_provider_in_flight: 1,
            min_request_interval: Some(Duration::from_secs(3)),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Hands out request start times at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next free slot and sleeps until it arrives.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug)]
struct ProviderGate {
    in_flight: Semaphore,
    pacer: Option<RequestPacer>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    gates: Mutex<HashMap<String, Arc<ProviderGate>>>,
    per_provider_in_flight: usize,
    min_request_interval: Option<Duration>,
    backoff: BackoffPolicy,
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
        let client = builder.build().context("building card api http client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            gates: Mutex::new(HashMap::new()),
            per_provider_in_flight: config.per_provider_in_flight.max(1),
            min_request_interval: config.min_request_interval.filter(|d| !d.is_zero()),
            backoff: config.backoff,
        })
    }

    async fn gate(&self, provider_id: &str) -> Arc<ProviderGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderGate {
                    in_flight: Semaphore::new(self.per_provider_in_flight),
                    pacer: self.min_request_interval.map(RequestPacer::new),
                })
            })
            .clone()
    }

    /// GETs `url` on behalf of `provider_id`.
    pub async fn fetch_bytes(
        &self,
        provider_id: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.gate(provider_id).await;
        let _provider = gate.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let _global = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("card_api_request", provider_id, url);
        self.send_with_retries(&gate, url, headers)
            .instrument(span)
            .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        provider_id: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(provider_id, url, headers).await?;
        serde_json::from_slice(&response.body).map_err(|err| FetchError::Decode {
            url: response.final_url,
            message: err.to_string(),
        })
    }

    async fn send_with_retries(
        &self,
        gate: &ProviderGate,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            if let Some(pacer) = &gate.pacer {
                pacer.wait_turn().await;
            }
            let attempts = retry + 1;
            let request = headers
                .iter()
                .fold(self.client.get(url), |req, (name, value)| req.header(*name, *value));

            let decision = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|source| FetchError::Request {
                            url: final_url.clone(),
                            source,
                        })?
                        .to_vec();
                    debug!(status = status.as_u16(), bytes = body.len(), attempts, "fetched");
                    return Ok(FetchedResponse { final_url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok());
                    match decide_for_status(status, retry_after) {
                        RetryDecision::Retry(hint) if retry < self.backoff.max_retries => {
                            warn!(
                                status = status.as_u16(),
                                retry,
                                "card api refused request; retrying"
                            );
                            hint
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: resp.url().to_string(),
                                attempts,
                            })
                        }
                    }
                }
                Err(err) => match decide_for_error(&err) {
                    RetryDecision::Retry(hint) if retry < self.backoff.max_retries => {
                        warn!(error = %err, retry, "card api request failed; retrying");
                        hint
                    }
                    _ => {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            source: err,
                        })
                    }
                },
            };

            tokio::time::sleep(self.backoff.wait_before_retry(retry, decision)).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_server_delay: Duration::from_secs(1),
        };

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(350));
        assert_eq!(
            policy.wait_before_retry(0, Some(Duration::from_secs(30))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn throttling_honours_retry_after() {
        assert_eq!(
            decide_for_status(StatusCode::TOO_MANY_REQUESTS, Some(" 7 ")),
            RetryDecision::Retry(Some(Duration::from_secs(7)))
        );
        assert_eq!(
            decide_for_status(
                StatusCode::SERVICE_UNAVAILABLE,
                Some("Wed, 21 Oct 2026 07:28:00 GMT")
            ),
            RetryDecision::Retry(None)
        );
        assert_eq!(
            decide_for_status(StatusCode::BAD_GATEWAY, None),
            RetryDecision::Retry(None)
        );
        assert_eq!(
            decide_for_status(StatusCode::UNAUTHORIZED, Some("5")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn exhausted_retries_report_attempts() {
        let err = FetchError::HttpStatus {
            status: 429,
            url: "https://api.test/cards".to_string(),
            attempts: 4,
        };
        assert!(err.to_string().contains("after 4 attempt(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_request_starts() {
        let pacer = RequestPacer::new(Duration::from_secs(3));
        let started = Instant::now();
        pacer.wait_turn().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() < Duration::from_secs(7));
    }
}
