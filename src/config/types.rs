use serde::Deserialize;

/// Main configuration structure for the harvester
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub output: OutputConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetEntry>,
}

/// Remote search API description
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Search endpoint URL
    pub endpoint: String,

    /// User agent sent with every request
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (seconds)
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Response field holding the array of records
    #[serde(rename = "items-field", default = "default_items_field")]
    pub items_field: String,

    /// Response field holding the authoritative match count
    #[serde(rename = "total-field", default = "default_total_field")]
    pub total_field: String,

    /// Record field holding the natural key
    #[serde(rename = "key-field", default = "default_key_field")]
    pub key_field: String,

    /// Record field holding the partitioning dimension
    #[serde(rename = "dimension-field", default = "default_dimension_field")]
    pub dimension_field: String,

    /// Filter name for the inclusive lower bound of the dimension
    #[serde(rename = "min-filter", default = "default_min_filter")]
    pub min_filter: String,

    /// Filter name for the upper bound of the dimension
    #[serde(rename = "max-filter", default = "default_max_filter")]
    pub max_filter: String,

    /// How the API compares against `max-filter`
    #[serde(rename = "max-filter-bound", default)]
    pub max_filter_bound: UpperBound,

    #[serde(rename = "sort-by", default = "default_sort_by")]
    pub sort_by: String,

    #[serde(rename = "sort-order", default = "default_sort_order")]
    pub sort_order: String,
}

/// Semantics of the API's upper-bound filter
///
/// A half-open range `[low, high)` is sent as `high - 1` against an inclusive
/// filter, which is only lossless when the dimension takes integer values. A
/// value strictly between `high - 1` and `high` is matched by no leaf. Use
/// `exclusive` when the API supports it or the dimension can be fractional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpperBound {
    /// The API matches values `<= max`
    #[default]
    Inclusive,
    /// The API matches values `< max`
    Exclusive,
}

impl UpperBound {
    /// Wire value of the upper filter for the half-open bound `high`
    pub fn encode(self, high: i64) -> i64 {
        match self {
            UpperBound::Inclusive => high - 1,
            UpperBound::Exclusive => high,
        }
    }
}

/// Partitioning and paging behavior
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Minimum time between two consecutive requests, across all workers (milliseconds)
    #[serde(rename = "rate-limit-delay")]
    pub rate_limit_delay: u64,

    /// Number of items the API will ever page through for one query
    #[serde(rename = "result-window", default = "default_result_window")]
    pub result_window: u64,

    /// Safety margin kept below the result window when accepting a leaf
    #[serde(rename = "window-margin", default)]
    pub window_margin: u64,

    /// Maximum recursion depth of the partition planner
    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    /// Ranges this narrow or narrower are never split
    #[serde(rename = "min-slice", default = "default_min_slice")]
    pub min_slice: i64,

    /// Items requested per page
    #[serde(rename = "page-size")]
    pub page_size: u64,

    /// Safety valve on pages fetched per leaf
    #[serde(rename = "max-pages", default)]
    pub max_pages: Option<u64>,

    /// Number of leaves crawled concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl CrawlerConfig {
    /// Largest match count a leaf may have and still be fully reachable
    pub fn window_limit(&self) -> u64 {
        self.result_window.saturating_sub(self.window_margin)
    }

    /// Page cap per leaf, derived from the result window when not configured
    pub fn effective_max_pages(&self) -> u64 {
        self.max_pages
            .unwrap_or_else(|| self.result_window.div_ceil(self.page_size.max(1)) + 1)
    }
}

/// Retry policy of the resilient fetch client
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, including the first one
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry (milliseconds)
    #[serde(rename = "base-delay", default = "default_base_delay")]
    pub base_delay: u64,

    /// Upper bound on the exponential part of the backoff (milliseconds)
    #[serde(rename = "max-delay", default = "default_max_delay")]
    pub max_delay: u64,

    /// Random jitter added on top of the backoff (milliseconds)
    #[serde(default = "default_jitter")]
    pub jitter: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// One crawl target: a transaction type crossed with categories, zones and coarse ranges
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    /// Transaction type sent as the API's filter type (e.g. "buy", "rent")
    pub transaction: String,

    /// Property categories to crawl
    pub categories: Vec<String>,

    /// Optional zone filters; an empty list crawls without a zone filter
    #[serde(default)]
    pub zones: Vec<String>,

    /// Coarse half-open ranges `[low, high)` over the partitioning dimension
    pub ranges: Vec<[i64; 2]>,
}

fn default_user_agent() -> String {
    format!("listing-harvester/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_items_field() -> String {
    "realEstateAds".to_string()
}

fn default_total_field() -> String {
    "total".to_string()
}

fn default_key_field() -> String {
    "id".to_string()
}

fn default_dimension_field() -> String {
    "price".to_string()
}

fn default_min_filter() -> String {
    "minPrice".to_string()
}

fn default_max_filter() -> String {
    "maxPrice".to_string()
}

fn default_sort_by() -> String {
    "publicationDate".to_string()
}

fn default_sort_order() -> String {
    "desc".to_string()
}

fn default_result_window() -> u64 {
    2400
}

fn default_min_slice() -> i64 {
    1
}

fn default_concurrency() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_jitter() -> u64 {
    500
}
