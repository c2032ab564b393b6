//! Outbound JSON fetches with bounded retries.
//!
//! A `429 Too Many Requests` sleeps `(n + 1) * rate_limit_delay` (linear, `n` = throttles seen so
//! far) and retries without spending the network-failure budget. Connection and timeout errors
//! retry after a fixed `network_delay`. Any other non-success status, or an undecodable body, ends
//! the fetch at once. Every failure resolves to `None` so callers can substitute a fallback.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use url::Url;

use crate::rate_limit::RateLimiter;

/// User agent sent with every enrichment request.
pub const USER_AGENT: &str = concat!("fastenrich/", env!("CARGO_PKG_VERSION"));

/// Retry and backoff knobs for [`RetryingFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed for network failures, and separately for 429 responses.
    pub max_retries: u32,
    /// Base delay for the linear 429 backoff.
    pub rate_limit_delay: Duration,
    /// Fixed delay before retrying a network failure.
    pub network_delay: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rate_limit_delay: Duration::from_secs(1),
            network_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Sleep applied after the `throttled`-th (zero-based) 429 response.
    pub fn throttle_backoff(&self, throttled: u32) -> Duration {
        self.rate_limit_delay.saturating_mul(throttled + 1)
    }
}

/// Issues JSON requests and absorbs transient upstream failures.
#[derive(Clone)]
pub struct RetryingFetcher {
    client: Client,
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
}

impl RetryingFetcher {
    /// Builds a fetcher with its own HTTP client.
    pub fn new(policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(policy.request_timeout)
            .build()?;
        Ok(Self {
            client,
            policy,
            limiter: None,
        })
    }

    /// Paces every attempt through `limiter`, keyed by upstream host.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Active retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `GET` shorthand for [`RetryingFetcher::fetch`].
    pub async fn get_json(&self, url: &Url) -> Option<Value> {
        self.fetch(Method::GET, url, None).await
    }

    /// Sends one request, retrying per the policy. Never fails: exhaustion or a terminal
    /// status yields `None`.
    pub async fn fetch(&self, method: Method, url: &Url, body: Option<&Value>) -> Option<Value> {
        let mut throttled = 0u32;
        let mut failures = 0u32;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire(url.host_str().unwrap_or_default()).await;
            }

            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        if throttled >= self.policy.max_retries {
                            tracing::warn!(%url, throttled, "upstream still throttling, giving up");
                            return None;
                        }
                        let delay = self.policy.throttle_backoff(throttled);
                        throttled += 1;
                        tracing::debug!(%url, ?delay, throttled, "429 from upstream, backing off");
                        sleep(delay).await;
                        continue;
                    }
                    if !status.is_success() {
                        tracing::warn!(%url, %status, "lookup failed");
                        return None;
                    }
                    return match response.json::<Value>().await {
                        Ok(value) => Some(value),
                        Err(err) => {
                            tracing::warn!(%url, error = %err, "malformed lookup response");
                            None
                        }
                    };
                }
                Err(err) => {
                    if failures >= self.policy.max_retries {
                        tracing::warn!(%url, error = %err, attempts = failures + 1, "lookup failed after retries");
                        return None;
                    }
                    failures += 1;
                    tracing::debug!(%url, error = %err, failures, "lookup error, retrying");
                    sleep(self.policy.network_delay).await;
                }
            }
        }
    }
}
