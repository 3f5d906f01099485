//! Rate-limited, retrying HTTP access to the racing API.
//!
//! Every outbound request goes through one [`RequestGate`]. The gate is built
//! once per process and handed to each client by `Arc`; two gates would each
//! allow the full rate and together exceed the API's ceiling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use paddock_core::{EventPage, HorseDetail, RaceEvent};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "paddock-fetch";

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
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } | FetchError::Exhausted { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
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

#[derive(Debug, Clone, Copy)]
pub struct RequestGateConfig {
    /// Ceiling on request starts per second. Zero or negative disables spacing.
    pub rate_per_sec: f64,
    pub backoff: BackoffPolicy,
}

impl Default for RequestGateConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 2.0,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Process-wide rate limiter and retry policy.
///
/// Spacing is a minimum-interval gate: a request may start no sooner than
/// `1 / rate` after the previous request started, whichever caller issued it.
#[derive(Debug)]
pub struct RequestGate {
    min_interval: Duration,
    backoff: BackoffPolicy,
    last_start: Mutex<Option<Instant>>,
}

impl RequestGate {
    /// Longest spacing the gate will enforce, however low the configured rate.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(config: RequestGateConfig) -> Self {
        let min_interval = if config.rate_per_sec > 0.0 {
            Duration::try_from_secs_f64(1.0 / config.rate_per_sec)
                .map_or(Self::MAX_INTERVAL, |interval| interval.min(Self::MAX_INTERVAL))
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            backoff: config.backoff,
            last_start: Mutex::new(None),
        }
    }

    pub fn shared(config: RequestGateConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Wait until this caller may start a request, then record the start.
    ///
    /// The lock is held across the sleep so concurrent callers queue up instead
    /// of all waking at the same deadline.
    pub async fn wait_turn(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Run `call` under the gate, retrying transient failures with exponential
    /// backoff. Every attempt, retries included, takes its own turn at the gate.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            self.wait_turn().await;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            if err.disposition() == RetryDisposition::NonRetryable {
                debug!(label, attempt, error = %err, "permanent failure, not retrying");
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt - 1);
            warn!(label, attempt, ?delay, error = %err, "transient failure, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.theracingapi.com".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Authenticated JSON client bound to a shared [`RequestGate`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
    gate: Arc<RequestGate>,
}

impl ApiClient {
    pub fn new(config: HttpClientConfig, gate: Arc<RequestGate>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let credentials = match (config.username, config.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            gate,
        })
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = self.url_for(path);
        let span = info_span!("api_get", url = %url);
        self.gate
            .execute(path, || self.get_json_once(&url, query))
            .instrument(span)
            .await
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let mut request = self.client.get(url).query(query);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            url: final_url,
            message: e.to_string(),
        })
    }
}

/// Per-entity detail lookup. A pure lookup: the same id always yields the same
/// fields, so calling it twice is harmless.
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_horse_detail(&self, horse_id: &str) -> Result<HorseDetail, FetchError>;
}

#[async_trait]
impl<T: DetailSource + ?Sized> DetailSource for Arc<T> {
    async fn fetch_horse_detail(&self, horse_id: &str) -> Result<HorseDetail, FetchError> {
        (**self).fetch_horse_detail(horse_id).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpDetailClient {
    api: ApiClient,
}

impl HttpDetailClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub fn detail_path(horse_id: &str) -> String {
        format!("v1/horses/{horse_id}/pro")
    }
}

#[async_trait]
impl DetailSource for HttpDetailClient {
    async fn fetch_horse_detail(&self, horse_id: &str) -> Result<HorseDetail, FetchError> {
        self.api.get_json(&Self::detail_path(horse_id), &[]).await
    }
}

/// Paginated, date-range-filtered results listing.
#[derive(Debug, Clone)]
pub struct ListingClient {
    api: ApiClient,
    page_size: u64,
}

impl ListingClient {
    pub const RESULTS_PATH: &'static str = "v1/results";

    pub fn new(api: ApiClient, page_size: u64) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
        }
    }

    pub async fn fetch_page(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        skip: u64,
    ) -> Result<EventPage, FetchError> {
        let query = [
            ("start_date", start.format("%Y-%m-%d").to_string()),
            ("end_date", end.format("%Y-%m-%d").to_string()),
            ("limit", self.page_size.to_string()),
            ("skip", skip.to_string()),
        ];
        self.api.get_json(Self::RESULTS_PATH, &query).await
    }

    /// Every event in `[start, end]`, in listing order.
    pub async fn fetch_events(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RaceEvent>, FetchError> {
        let mut events = Vec::new();
        let mut skip = 0u64;
        loop {
            let page = self.fetch_page(start, end, skip).await?;
            let received = page.results.len() as u64;
            events.extend(page.results);
            skip += received;

            if !has_more(received, self.page_size, skip, page.total) {
                break;
            }
        }
        debug!(%start, %end, events = events.len(), "listing fetched");
        Ok(events)
    }
}

fn has_more(received: u64, page_size: u64, next_skip: u64, total: Option<u64>) -> bool {
    if received == 0 || received < page_size {
        return false;
    }
    match total {
        Some(total) => next_skip < total,
        None => true,
    }
}
