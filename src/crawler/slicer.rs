//! Sequential paging through one leaf partition

use crate::config::CrawlerConfig;
use crate::crawler::fetcher::{FetchError, FetchRequest, ResilientFetcher};
use crate::state::{LeafPartition, PartitionRange, Segment};
use crate::storage::RawRecord;
use std::sync::Arc;

/// Paging bounds shared by every leaf of a crawl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLimits {
    pub page_size: u64,
    /// Offsets at or beyond this are never requested
    pub result_window: u64,
    /// Safety valve against a `total` that never drains
    pub max_pages: u64,
}

impl SliceLimits {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            page_size: config.page_size,
            result_window: config.result_window,
            max_pages: config.effective_max_pages(),
        }
    }
}

/// Lazy page cursor over a leaf partition
///
/// Each call to [`next_page`](Self::next_page) performs at most one fetch, so
/// the caller decides when to stop pulling (e.g. on cancellation) and never
/// holds more than one page in memory.
pub struct SlicePager {
    fetcher: Arc<ResilientFetcher>,
    segment: Segment,
    range: PartitionRange,
    limits: SliceLimits,
    from: u64,
    pages: u64,
    total: Option<u64>,
    delivered: u64,
    done: bool,
    truncated: bool,
}

impl SlicePager {
    pub fn new(
        fetcher: Arc<ResilientFetcher>,
        segment: Segment,
        leaf: &LeafPartition,
        limits: SliceLimits,
    ) -> Self {
        Self {
            fetcher,
            segment,
            range: leaf.range,
            limits,
            from: 0,
            pages: 0,
            total: None,
            delivered: 0,
            done: false,
            truncated: false,
        }
    }

    /// Records delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// True once the page cap ended the leaf before the window or the
    /// reported total was reached, so records may be missing
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Fetches the next page
    ///
    /// Returns `Ok(None)` once the leaf is exhausted. A failed fetch is
    /// returned once and ends the cursor; so does cancellation, which is
    /// reported as a cancelled [`FetchError`] so the leaf is not mistaken for
    /// a complete one.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, FetchError> {
        if self.done || self.exhausted() {
            self.done = true;
            return Ok(None);
        }

        if self.fetcher.is_cancelled() {
            self.done = true;
            return Err(FetchError::cancelled());
        }

        let request = FetchRequest {
            segment: self.segment.clone(),
            range: self.range,
            from: self.from,
            size: self
                .limits
                .page_size
                .min(self.limits.result_window - self.from),
        };

        let response = match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        self.pages += 1;
        self.total = Some(response.total);

        let returned = response.items.len() as u64;
        if returned == 0 {
            self.done = true;
            return Ok(None);
        }

        let mut items = response.items;
        let remaining = response.total.saturating_sub(self.delivered);
        if returned > remaining {
            items.truncate(remaining as usize);
        }

        self.from += returned;
        self.delivered += items.len() as u64;
        tracing::debug!(
            "Page {} of {} {}: {} records (from {}, total {})",
            self.pages,
            self.segment,
            self.range,
            items.len(),
            request.from,
            response.total
        );

        if items.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(items))
    }

    fn exhausted(&mut self) -> bool {
        if self.from >= self.limits.result_window {
            return true;
        }
        if matches!(self.total, Some(total) if self.from >= total) {
            return true;
        }
        if self.pages >= self.limits.max_pages {
            // Window and total both still ahead of the cursor
            self.truncated = true;
            tracing::debug!(
                "Page cap of {} reached for {} {} after {} of {:?} records",
                self.limits.max_pages,
                self.segment,
                self.range,
                self.delivered,
                self.total
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::tests::fast_policy;
    use crate::crawler::fetcher::{FetchErrorKind, FetchResponse, SearchApi};
    use crate::crawler::rate_limit::RateLimiter;
    use crate::state::CrawlStats;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Serves `len` synthetic records, reporting `reported_total` as the count
    struct ListingApi {
        len: u64,
        reported_total: u64,
        fail_from: Option<u64>,
        /// Serves at most this many items per page regardless of `size`
        page_len: Option<u64>,
        calls: AtomicUsize,
    }

    impl ListingApi {
        fn new(len: u64) -> Self {
            Self {
                len,
                reported_total: len,
                fail_from: None,
                page_len: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchApi for ListingApi {
        async fn search(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if matches!(self.fail_from, Some(offset) if request.from >= offset) {
                return Err(FetchError::permanent("HTTP 404"));
            }
            let size = self.page_len.map_or(request.size, |len| len.min(request.size));
            let end = (request.from + size).min(self.len);
            let items = (request.from..end)
                .map(|i| {
                    let payload = json!({"id": format!("ad-{}", i), "price": i});
                    RawRecord::from_payload(payload.as_object().cloned().unwrap(), "id", "price")
                })
                .collect();
            Ok(FetchResponse {
                items,
                total: self.reported_total,
            })
        }
    }

    fn pager(api: Arc<ListingApi>, limits: SliceLimits, cancel: CancellationToken) -> SlicePager {
        let fetcher = Arc::new(ResilientFetcher::new(
            api,
            fast_policy(2),
            Arc::new(RateLimiter::new(Duration::ZERO)),
            Arc::new(CrawlStats::new()),
            cancel,
        ));
        let leaf = LeafPartition {
            range: PartitionRange::new(0, 1000).unwrap(),
            depth: 0,
            probed_count: None,
            capped: false,
        };
        SlicePager::new(fetcher, Segment::new("buy", "flat", None), &leaf, limits)
    }

    fn limits(page_size: u64, result_window: u64, max_pages: u64) -> SliceLimits {
        SliceLimits {
            page_size,
            result_window,
            max_pages,
        }
    }

    async fn drain(pager: &mut SlicePager) -> Vec<RawRecord> {
        let mut all = Vec::new();
        while let Some(page) = pager.next_page().await.unwrap() {
            all.extend(page);
        }
        all
    }

    #[tokio::test]
    async fn test_pages_until_total() {
        let api = Arc::new(ListingApi::new(250));
        let mut pager = pager(api.clone(), limits(100, 2400, 30), CancellationToken::new());

        let records = drain(&mut pager).await;

        assert_eq!(records.len(), 250);
        assert_eq!(records[0].natural_key.as_deref(), Some("ad-0"));
        assert_eq!(records[249].natural_key.as_deref(), Some("ad-249"));
        assert_eq!(pager.pages(), 3);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert!(!pager.truncated());
    }

    #[tokio::test]
    async fn test_empty_page_stops() {
        let api = Arc::new(ListingApi {
            reported_total: 1000,
            ..ListingApi::new(150)
        });
        let mut pager = pager(api.clone(), limits(100, 2400, 30), CancellationToken::new());

        let records = drain(&mut pager).await;

        assert_eq!(records.len(), 150);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_reported_total() {
        let api = Arc::new(ListingApi {
            reported_total: 130,
            ..ListingApi::new(500)
        });
        let mut pager = pager(api, limits(100, 2400, 30), CancellationToken::new());

        let records = drain(&mut pager).await;

        assert_eq!(records.len(), 130);
        assert_eq!(pager.delivered(), 130);
    }

    #[tokio::test]
    async fn test_page_cap() {
        let api = Arc::new(ListingApi::new(1000));
        let mut pager = pager(api.clone(), limits(100, 2400, 2), CancellationToken::new());

        let records = drain(&mut pager).await;

        assert_eq!(records.len(), 200);
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert!(pager.truncated());
    }

    #[tokio::test]
    async fn test_short_pages_hit_cap_are_truncated() {
        // 5 items per page against a 15 page size: 4 pages cover 20 of 40
        let api = Arc::new(ListingApi {
            page_len: Some(5),
            ..ListingApi::new(40)
        });
        let mut pager = pager(api.clone(), limits(15, 40, 4), CancellationToken::new());

        let records = drain(&mut pager).await;

        assert_eq!(records.len(), 20);
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
        assert!(pager.truncated());
    }

    #[tokio::test]
    async fn test_cap_on_last_needed_page_is_not_truncated() {
        let api = Arc::new(ListingApi::new(200));
        let mut pager = pager(api.clone(), limits(100, 2400, 2), CancellationToken::new());

        let records = drain(&mut pager).await;

        assert_eq!(records.len(), 200);
        assert!(!pager.truncated());
    }

    #[tokio::test]
    async fn test_stops_at_result_window() {
        let api = Arc::new(ListingApi::new(5000));
        let mut pager = pager(api.clone(), limits(100, 250, 30), CancellationToken::new());

        let records = drain(&mut pager).await;

        // Last request is shrunk to the 50 items left in the window
        assert_eq!(records.len(), 250);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert!(!pager.truncated());
    }

    #[tokio::test]
    async fn test_failure_ends_leaf() {
        let api = Arc::new(ListingApi {
            fail_from: Some(100),
            ..ListingApi::new(300)
        });
        let mut pager = pager(api, limits(100, 2400, 30), CancellationToken::new());

        let first = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 100);

        let error = pager.next_page().await.unwrap_err();
        assert_eq!(error.kind, FetchErrorKind::Permanent);

        assert!(pager.next_page().await.unwrap().is_none());
        assert_eq!(pager.delivered(), 100);
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let api = Arc::new(ListingApi::new(300));
        let cancel = CancellationToken::new();
        let mut pager = pager(api.clone(), limits(100, 2400, 30), cancel.clone());

        assert!(pager.next_page().await.unwrap().is_some());
        cancel.cancel();

        let error = pager.next_page().await.unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }
}
