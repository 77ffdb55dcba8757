//! Integration tests for the harvester
//!
//! These tests use wiremock to stand up a fake search API over a synthetic
//! listing market and run the full crawl cycle end-to-end.

use listing_harvester::config::{
    ApiConfig, Config, CrawlerConfig, OutputConfig, RetryConfig, TargetEntry, UpperBound,
};
use listing_harvester::crawler::Coordinator;
use listing_harvester::storage::{RunStatus, SqliteStorage, Storage};
use listing_harvester::PartitionRange;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[derive(Clone)]
struct Listing {
    id: String,
    category: String,
    zone: String,
    price: f64,
}

/// Fake search endpoint that decodes the `filters` parameter and serves the
/// matching slice of its listings
#[derive(Clone)]
struct Market {
    listings: Vec<Listing>,
    result_window: u64,
    /// Page requests overlapping this inclusive price band answer 404
    broken_band: Option<(i64, i64)>,
    /// Matches `price < maxPrice` instead of `price <= maxPrice`
    exclusive_max: bool,
}

impl Market {
    fn new() -> Self {
        let mut listings = Vec::new();
        for i in 0..500i64 {
            listings.push(Listing {
                id: format!("flat-{}", i),
                category: "flat".to_string(),
                zone: if i % 2 == 0 { "75-" } else { "92-" }.to_string(),
                price: ((i * 7919) % 100_000) as f64,
            });
        }
        for i in 0..80i64 {
            listings.push(Listing {
                id: format!("house-{}", i),
                category: "house".to_string(),
                zone: "92-".to_string(),
                price: (1000 + i * 500) as f64,
            });
        }
        Self {
            listings,
            result_window: 60,
            broken_band: None,
            exclusive_max: false,
        }
    }
}

impl Respond for Market {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let filters: Value = match request
            .url
            .query_pairs()
            .find(|(key, _)| key == "filters")
            .and_then(|(_, value)| serde_json::from_str(&value).ok())
        {
            Some(filters) => filters,
            None => return ResponseTemplate::new(400),
        };

        let min = filters["minPrice"].as_f64().unwrap_or(f64::MIN);
        let max = filters["maxPrice"].as_f64().unwrap_or(f64::MAX);
        let from = filters["from"].as_u64().unwrap_or(0);
        let size = filters["size"].as_u64().unwrap_or(24);
        let category = filters["propertyType"][0].as_str().unwrap_or_default();
        let zone = filters["zoneIdsByTypes"]["zoneIds"][0].as_str();

        if let Some((low, high)) = self.broken_band {
            if size > 1 && min <= high as f64 && low as f64 <= max {
                return ResponseTemplate::new(404);
            }
        }
        if from + size > self.result_window {
            return ResponseTemplate::new(400);
        }

        let matches: Vec<&Listing> = self
            .listings
            .iter()
            .filter(|l| l.category == category && l.price >= min)
            .filter(|l| {
                if self.exclusive_max {
                    l.price < max
                } else {
                    l.price <= max
                }
            })
            .filter(|l| zone.map_or(true, |z| l.zone == z))
            .collect();

        let items: Vec<Value> = matches
            .iter()
            .skip(from as usize)
            .take(size as usize)
            .map(|l| json!({"id": l.id, "price": l.price, "title": format!("{} in {}", l.category, l.zone)}))
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({
            "total": matches.len(),
            "realEstateAds": items,
        }))
    }
}

/// Creates a test configuration pointed at the mock server
fn create_test_config(endpoint: &str, db_path: &str) -> Config {
    Config {
        api: ApiConfig {
            endpoint: endpoint.to_string(),
            user_agent: "listing-harvester-tests".to_string(),
            timeout_secs: 5,
            items_field: "realEstateAds".to_string(),
            total_field: "total".to_string(),
            key_field: "id".to_string(),
            dimension_field: "price".to_string(),
            min_filter: "minPrice".to_string(),
            max_filter: "maxPrice".to_string(),
            max_filter_bound: UpperBound::Inclusive,
            sort_by: "publicationDate".to_string(),
            sort_order: "desc".to_string(),
        },
        crawler: CrawlerConfig {
            rate_limit_delay: 0,
            result_window: 60,
            window_margin: 0,
            max_depth: 16,
            min_slice: 1,
            page_size: 25,
            max_pages: None,
            concurrency: 4,
        },
        retry: RetryConfig {
            max_attempts: 3,
            base_delay: 1,
            max_delay: 5,
            jitter: 1,
        },
        output: OutputConfig {
            database_path: db_path.to_string(),
        },
        targets: vec![TargetEntry {
            transaction: "buy".to_string(),
            categories: vec!["flat".to_string(), "house".to_string()],
            zones: vec![],
            ranges: vec![[0, 50_000], [50_000, 100_000]],
        }],
    }
}

struct Harness {
    server: MockServer,
    _dir: TempDir,
    db_path: String,
}

impl Harness {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("listings.db").to_string_lossy().to_string();
        Self {
            server,
            _dir: dir,
            db_path,
        }
    }

    async fn mount_market(&self, market: Market) {
        Mock::given(method("GET"))
            .and(path("/realEstateAds.json"))
            .respond_with(market)
            .mount(&self.server)
            .await;
    }

    fn config(&self) -> Config {
        create_test_config(
            &format!("{}/realEstateAds.json", self.server.uri()),
            &self.db_path,
        )
    }

    fn storage(&self) -> SqliteStorage {
        SqliteStorage::new(Path::new(&self.db_path)).expect("Failed to open database")
    }

    async fn crawl(&self, config: Config) -> listing_harvester::CrawlReport {
        Coordinator::new(config, "test-hash", false, CancellationToken::new())
            .expect("Failed to create coordinator")
            .run()
            .await
            .expect("Crawl failed")
    }
}

#[tokio::test]
async fn test_full_crawl_harvests_every_listing() {
    let harness = Harness::start().await;
    harness.mount_market(Market::new()).await;

    let report = harness.crawl(harness.config()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.inserted, 580);
    assert_eq!(report.stats.updated, 0);
    assert_eq!(report.stats.skipped, 0);
    assert_eq!(report.stats.partitions_capped, 0);
    assert!(report.stats.leaves_crawled > 10, "window should force many leaves");

    let storage = harness.storage();
    assert_eq!(storage.count_records().unwrap(), 580);
    assert_eq!(
        storage.count_by_category().unwrap(),
        vec![("flat".to_string(), 500), ("house".to_string(), 80)]
    );

    let record = storage.get_record("flat-1").unwrap().expect("flat-1 stored");
    assert_eq!(record.transaction, "buy");
    assert_eq!(record.dimension, Some(7919.0));
    assert_eq!(record.payload["title"], "flat in 92-");

    let cheap_houses = storage
        .records_in_range("house", PartitionRange::new(0, 5000).unwrap())
        .unwrap();
    assert_eq!(cheap_houses.len(), 8);
}

#[tokio::test]
async fn test_rerun_updates_without_duplicates() {
    let harness = Harness::start().await;
    harness.mount_market(Market::new()).await;

    let first = harness.crawl(harness.config()).await;
    let second = harness.crawl(harness.config()).await;

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.stats.inserted, 0);
    assert_eq!(second.stats.updated, 580);

    let storage = harness.storage();
    assert_eq!(storage.count_records().unwrap(), 580);

    let record = storage.get_record("house-3").unwrap().unwrap();
    assert_eq!(record.seen_count, 2);
    assert_eq!(record.first_seen_run, first.run_id);
    assert_eq!(record.last_seen_run, second.run_id);
    assert!(record.last_seen_at > record.first_seen_at);
}

#[tokio::test]
async fn test_zone_segments() {
    let harness = Harness::start().await;
    harness.mount_market(Market::new()).await;

    let mut config = harness.config();
    config.targets[0].categories = vec!["flat".to_string()];
    config.targets[0].zones = vec!["75-".to_string()];

    let report = harness.crawl(config).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.inserted, 250);

    let storage = harness.storage();
    let record = storage.get_record("flat-2").unwrap().unwrap();
    assert_eq!(record.zone.as_deref(), Some("75-"));
    assert!(storage.get_record("flat-1").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_leaf_does_not_stop_crawl() {
    let harness = Harness::start().await;
    harness
        .mount_market(Market {
            broken_band: Some((20_000, 20_999)),
            ..Market::new()
        })
        .await;

    let mut config = harness.config();
    config.targets[0].categories = vec!["flat".to_string()];

    let report = harness.crawl(config).await;

    assert_eq!(report.status, RunStatus::Partial);
    assert!(report.stats.leaves_failed >= 1);
    assert!(report.stats.leaves_crawled > report.stats.leaves_failed);

    let storage = harness.storage();
    let stored = storage.count_records().unwrap();
    assert!(stored > 400 && stored < 500, "stored {}", stored);

    // Listings far from the broken band were still ingested
    assert!(storage.get_record("flat-0").unwrap().is_some());
    let expensive = storage
        .records_in_range("flat", PartitionRange::new(90_000, 100_000).unwrap())
        .unwrap();
    assert!(!expensive.is_empty());

    let run = storage.get_run(report.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.stats.unwrap().leaves_failed, report.stats.leaves_failed);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let harness = Harness::start().await;

    // The first two requests fail, everything after is served normally
    Mock::given(method("GET"))
        .and(path("/realEstateAds.json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&harness.server)
        .await;
    harness.mount_market(Market::new()).await;

    let report = harness.crawl(harness.config()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.fetch_errors, 2);
    assert_eq!(report.stats.fetch_retries, 2);
    assert_eq!(report.stats.probe_failures, 0);
    assert_eq!(report.stats.inserted, 580);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/realEstateAds.json"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&harness.server)
        .await;

    let mut config = harness.config();
    config.crawler.max_depth = 3;
    config.targets[0].categories = vec!["flat".to_string()];
    config.targets[0].ranges = vec![[0, 100_000]];

    let report = harness.crawl(config).await;

    // Unknown counts force splits down to depth 3: 15 probes, 8 capped leaves
    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.stats.probe_failures, 15);
    assert_eq!(report.stats.partitions_capped, 8);
    assert_eq!(report.stats.leaves_failed, 8);
    assert_eq!(report.stats.fetch_retries, 0);

    let requests = harness.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 15 + 8);
    assert_eq!(harness.storage().count_records().unwrap(), 0);
}

#[tokio::test]
async fn test_interrupted_run_is_resumed() {
    let harness = Harness::start().await;
    harness.mount_market(Market::new()).await;

    let cancel = CancellationToken::new();
    let coordinator = Coordinator::new(harness.config(), "test-hash", false, cancel.clone())
        .expect("Failed to create coordinator");
    cancel.cancel();
    let interrupted = coordinator.run().await.unwrap();
    assert_eq!(interrupted.status, RunStatus::Interrupted);

    let resumed = harness.crawl(harness.config()).await;

    assert_eq!(resumed.run_id, interrupted.run_id);
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.stats.inserted, 580);
    assert_eq!(
        harness.storage().get_run(resumed.run_id).unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn test_fractional_prices_at_split_points_with_exclusive_bound() {
    let harness = Harness::start().await;
    // 200 lofts at 499.5, 999.5, ..., 99999.5, each just below a round price
    let mut market = Market::new();
    for k in 1..=200i64 {
        market.listings.push(Listing {
            id: format!("loft-{}", k),
            category: "loft".to_string(),
            zone: "75-".to_string(),
            price: (k * 500) as f64 - 0.5,
        });
    }
    market.exclusive_max = true;
    harness.mount_market(market).await;

    let mut config = harness.config();
    config.api.max_filter_bound = UpperBound::Exclusive;
    config.targets[0].categories = vec!["loft".to_string()];

    let report = harness.crawl(config).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.stats.partitions_subdivided > 0);
    assert_eq!(report.stats.inserted, 200);

    let storage = harness.storage();
    assert_eq!(storage.count_records().unwrap(), 200);
    let record = storage.get_record("loft-50").unwrap().expect("loft-50 stored");
    assert_eq!(record.dimension, Some(24_999.5));
}

#[tokio::test]
async fn test_short_pages_leave_run_partial_and_resumable() {
    let harness = Harness::start().await;
    // Serves at most 10 items per page whatever size is asked for
    Mock::given(method("GET"))
        .and(path("/realEstateAds.json"))
        .respond_with(ShortPages(Market::new(), 10))
        .mount(&harness.server)
        .await;

    let mut config = harness.config();
    config.crawler.max_pages = Some(2);
    config.targets[0].categories = vec!["house".to_string()];

    let report = harness.crawl(config).await;

    assert_eq!(report.status, RunStatus::Partial);
    assert!(report.stats.leaves_truncated > 0);
    assert!(report.stats.inserted < 80);

    let storage = harness.storage();
    let run = storage.get_run(report.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(
        storage.completed_leaves(report.run_id).unwrap().len() as u64,
        report.stats.leaves_crawled
    );
}

/// Wraps a market and trims every page to at most `.1` items
struct ShortPages(Market, usize);

impl Respond for ShortPages {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let full = self.0.respond(request);
        let mut url = request.url.clone();
        let filters: Option<Value> = url
            .query_pairs()
            .find(|(key, _)| key == "filters")
            .and_then(|(_, value)| serde_json::from_str(&value).ok());
        let Some(mut filters) = filters else {
            return full;
        };
        let size = filters["size"].as_u64().unwrap_or(0);
        if size as usize <= self.1 {
            return full;
        }
        filters["size"] = json!(self.1);
        url.query_pairs_mut()
            .clear()
            .append_pair("filters", &filters.to_string());
        let mut trimmed = request.clone();
        trimmed.url = url;
        self.0.respond(&trimmed)
    }
}
