//! Search API access with bounded retries
//!
//! This module handles every request the harvester sends, including:
//! - The `SearchApi` seam, so the remote API can be swapped for a fake
//! - The reqwest-backed `HttpSearchApi` and its error classification
//! - The `ResilientFetcher`, which paces, retries and counts every call

use crate::config::{ApiConfig, RetryConfig};
use crate::crawler::rate_limit::RateLimiter;
use crate::state::{CrawlStats, PartitionRange, Segment};
use crate::storage::RawRecord;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One page request against one segment and dimension range
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub segment: Segment,
    pub range: PartitionRange,
    /// Offset of the first item
    pub from: u64,
    /// Page size
    pub size: u64,
}

impl FetchRequest {
    /// Smallest possible request, used to learn the match count of a range
    pub fn probe(segment: &Segment, range: PartitionRange) -> Self {
        Self {
            segment: segment.clone(),
            range,
            from: 0,
            size: 1,
        }
    }
}

/// A decoded page of results
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub items: Vec<RawRecord>,
    /// True match count for the request's filters, even beyond the result window
    pub total: u64,
}

/// Classification of a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Worth retrying: timeouts, connection failures, 5xx, rate limiting
    Transient,
    /// Retrying cannot help, or the retry budget is spent
    Permanent,
    /// The crawl was cancelled while waiting to retry
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A failed fetch; handled by the caller, never fatal to a crawl
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} fetch failure: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FetchErrorKind::Cancelled,
            message: "crawl cancelled".to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FetchErrorKind::Cancelled
    }
}

/// A single attempt against the search API
///
/// Implementations perform exactly one request and classify its failure; pacing
/// and retrying are the [`ResilientFetcher`]'s job.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The search API configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &ApiConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// `SearchApi` over HTTP: a GET with the whole query JSON-encoded in `filters`
pub struct HttpSearchApi {
    client: Client,
    config: ApiConfig,
}

impl HttpSearchApi {
    pub fn new(config: &ApiConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
            config: config.clone(),
        })
    }

    /// Encodes a request as the API's filter object
    ///
    /// `[low, high)` is sent as `min = low` plus an upper bound encoded per
    /// [`UpperBound`](crate::config::UpperBound): `high - 1` against an
    /// inclusive max filter, `high` against an exclusive one.
    pub fn filters(&self, request: &FetchRequest) -> Value {
        let mut filters = json!({
            "size": request.size,
            "from": request.from,
            "page": request.from / request.size.max(1) + 1,
            "filterType": request.segment.transaction,
            "propertyType": [request.segment.category],
            "sortBy": self.config.sort_by,
            "sortOrder": self.config.sort_order,
            "onTheMarket": [true],
        });

        filters[self.config.min_filter.as_str()] = json!(request.range.low);
        filters[self.config.max_filter.as_str()] = json!(self
            .config
            .max_filter_bound
            .encode(request.range.high));

        if let Some(zone) = &request.segment.zone {
            filters["zoneIdsByTypes"] = json!({ "zoneIds": [zone] });
        }

        filters
    }

    /// Decodes a response body into records and the match count
    pub fn decode(&self, body: Value) -> Result<FetchResponse, FetchError> {
        let total = body
            .get(&self.config.total_field)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                FetchError::permanent(format!(
                    "response has no numeric '{}' field",
                    self.config.total_field
                ))
            })?;

        let items = match body.get(&self.config.items_field) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    let payload = item.as_object().cloned().unwrap_or_else(Map::new);
                    RawRecord::from_payload(
                        payload,
                        &self.config.key_field,
                        &self.config.dimension_field,
                    )
                })
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(FetchError::permanent(format!(
                    "'{}' is not an array",
                    self.config.items_field
                )))
            }
        };

        Ok(FetchResponse { items, total })
    }
}

/// Maps a reqwest failure onto the retry taxonomy
fn classify_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::transient("request timeout")
    } else if error.is_connect() || error.is_request() || error.is_body() {
        FetchError::transient(error.to_string())
    } else {
        FetchError::permanent(error.to_string())
    }
}

#[async_trait]
impl SearchApi for HttpSearchApi {
    async fn search(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let filters = self.filters(request).to_string();

        let response = self
            .client
            .get(&self.config.endpoint)
            .header("Accept", "application/json")
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::transient(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(FetchError::permanent(format!("HTTP {}", status.as_u16())));
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::permanent(format!("malformed response: {}", e))
            } else {
                classify_reqwest_error(e)
            }
        })?;

        self.decode(body)
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0 for the first retry):
    /// `min(base * 2^attempt, max) + random(0..=jitter)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exponential = base
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay.as_millis() as u64);
        let jitter = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        Duration::from_millis(exponential + jitter)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay),
            max_delay: Duration::from_millis(config.max_delay),
            jitter: Duration::from_millis(config.jitter),
        }
    }
}

/// Paced, retrying access to a [`SearchApi`]
///
/// Holds no mutable state of its own; the rate limiter and the counters are
/// shared, so one fetcher serves every worker of a crawl.
pub struct ResilientFetcher {
    api: Arc<dyn SearchApi>,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
    stats: Arc<CrawlStats>,
    cancel: CancellationToken,
}

impl ResilientFetcher {
    pub fn new(
        api: Arc<dyn SearchApi>,
        policy: RetryPolicy,
        limiter: Arc<RateLimiter>,
        stats: Arc<CrawlStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            policy,
            limiter,
            stats,
            cancel,
        }
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Performs one logical fetch
    ///
    /// Transient failures are retried until the attempt budget is spent, which
    /// turns them into a permanent failure for this call only. Only permanent
    /// and cancelled errors are ever returned.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            tokio::select! {
                _ = self.limiter.acquire() => {}
                _ = self.cancel.cancelled() => return Err(FetchError::cancelled()),
            }

            let error = match self.api.search(request).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            self.stats.fetch_error();
            attempt += 1;

            if !error.is_transient() {
                return Err(error);
            }

            if attempt >= max_attempts {
                return Err(FetchError::permanent(format!(
                    "retry budget exhausted after {} attempts: {}",
                    attempt, error.message
                )));
            }

            let delay = self.policy.backoff(attempt - 1);
            tracing::trace!(
                "Retrying {} {} (attempt {}/{}) in {:?}: {}",
                request.segment,
                request.range,
                attempt + 1,
                max_attempts,
                delay,
                error.message
            );
            self.stats.fetch_retry();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(FetchError::cancelled()),
            }
        }
    }
}
