//! Crawler module for window-limited search APIs
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching with retry logic and global rate limiting
//! - Adaptive partitioning of coarse ranges under the result window
//! - Paging through each leaf partition
//! - Overall crawl coordination

mod coordinator;
mod fetcher;
mod planner;
mod rate_limit;
mod slicer;

pub use coordinator::{plan_only, run_crawl, work_list, Coordinator, CrawlReport, WorkItem};
pub use fetcher::{
    build_http_client, FetchError, FetchErrorKind, FetchRequest, FetchResponse, HttpSearchApi,
    ResilientFetcher, RetryPolicy, SearchApi,
};
pub use planner::{FetchProber, PartitionPlanner, PlanLimits, Prober};
pub use rate_limit::RateLimiter;
pub use slicer::{SliceLimits, SlicePager};
