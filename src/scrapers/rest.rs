//! Shared REST transport for the exchange clients.
//!
//! Every request goes through the per-exchange `RateLimiter` and is retried
//! with exponential backoff on transport errors, timeouts, HTTP 429 and 5xx.
//! Other non-success statuses are returned immediately so the exchange
//! client can classify them (e.g. unknown symbol).

use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::error::{ScanError, ScanResult};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const USER_AGENT: &str = "trade-scanner/1.0";

/// Transport knobs shared by all exchange clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestSettings {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub min_request_interval: Duration,
}

impl RestSettings {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries.max(1),
            min_request_interval: config.min_request_interval(),
        }
    }
}

impl Default for RestSettings {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default())
    }
}

/// Minimum spacing between requests to one exchange. Safe to share across tasks:
/// each caller reserves the next free slot under the lock, then sleeps outside it.
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.min_interval;
            slot - now
        };

        if !wait.is_zero() {
            debug!("Rate limiting: waiting {}ms", wait.as_millis());
            sleep(wait).await;
        }
    }
}

/// Failure of a single logical GET after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum RestError {
    /// Non-retryable status, or the last retryable status once attempts ran out.
    Status { status: StatusCode, body: String },
    /// Connection failure, timeout, or unreadable body.
    Transport(String),
}

impl std::fmt::Display for RestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { status, body } => write!(f, "HTTP {}: {}", status, truncate(body, 200)),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RestError {}

impl From<RestError> for ScanError {
    fn from(e: RestError) -> Self {
        ScanError::Network(e.to_string())
    }
}

pub struct RestClient {
    client: Client,
    venue: &'static str,
    base_url: String,
    limiter: RateLimiter,
    settings: RestSettings,
}

impl RestClient {
    pub fn new(venue: &'static str, base_url: &str, settings: RestSettings) -> ScanResult<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ScanError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            venue,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(settings.min_request_interval),
            settings,
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET `path` and return the body of the first successful response.
    pub async fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String, RestError> {
        let url = self.url(path);
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_error = RestError::Transport(format!("no attempt made for {}", url));

        for attempt in 0..self.settings.max_retries {
            self.limiter.acquire().await;

            let request = self.client.get(&url).query(query);
            let mut delay = retry_delay(backoff, false);

            match timeout(self.settings.request_timeout, request.send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().await.map_err(|e| {
                            RestError::Transport(format!("failed to read body from {}: {}", url, e))
                        });
                    }

                    let body = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(
                            venue = self.venue,
                            attempt = attempt + 1,
                            "Rate limited, backing off"
                        );
                        delay = retry_delay(backoff, true);
                    } else if status.is_server_error() {
                        warn!(
                            venue = self.venue,
                            attempt = attempt + 1,
                            %status,
                            "Server error"
                        );
                    } else {
                        debug!(venue = self.venue, %status, url = %url, "Request rejected");
                        return Err(RestError::Status { status, body });
                    }
                    last_error = RestError::Status { status, body };
                }
                Ok(Err(e)) => {
                    warn!(
                        venue = self.venue,
                        attempt = attempt + 1,
                        error = %e,
                        "Request failed"
                    );
                    last_error = RestError::Transport(format!("GET {} failed: {}", url, e));
                }
                Err(_) => {
                    warn!(venue = self.venue, attempt = attempt + 1, "Request timeout");
                    last_error = RestError::Transport(format!("GET {} timed out", url));
                }
            }

            if attempt + 1 < self.settings.max_retries {
                debug!("Retrying in {}ms", delay.as_millis());
                sleep(delay).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(last_error)
    }
}

/// Wait before the next attempt. HTTP 429 waits ten times longer; both are capped.
fn retry_delay(backoff_ms: u64, rate_limited: bool) -> Duration {
    let ms = if rate_limited { backoff_ms * 10 } else { backoff_ms };
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Numbers arrive as JSON strings ("0.1234") or plain numbers depending on the venue.
pub fn value_f64(v: &Value) -> Option<f64> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|x| x.is_finite())
}

pub fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn de_string_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    value_f64(&v).ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {}", v)))
}
