//! Crawler coordinator - main crawl orchestration logic
//!
//! This module drives a whole crawl, including:
//! - Expanding the configured targets into segment × coarse range work items
//! - Creating a run or resuming the latest unfinished one
//! - Planning each coarse range into leaf partitions
//! - Fanning leaves out to a bounded pool of paging workers
//! - Recording completed leaves, statistics and the final run status

use crate::config::Config;
use crate::crawler::fetcher::{HttpSearchApi, ResilientFetcher, RetryPolicy, SearchApi};
use crate::crawler::planner::{FetchProber, PartitionPlanner, PlanLimits};
use crate::crawler::rate_limit::RateLimiter;
use crate::crawler::slicer::{SliceLimits, SlicePager};
use crate::state::{CrawlStats, LeafPartition, PartitionRange, Segment, StatsSnapshot};
use crate::storage::{
    RawRecord, RecordContext, RunStatus, SqliteStorage, Storage, StorageError, UpsertOutcome,
};
use crate::HarvestError;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Progress is logged each time this many leaves have finished
const PROGRESS_INTERVAL: u64 = 10;

/// A coarse range of one segment, planned independently of all others
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub segment: Segment,
    pub range: PartitionRange,
}

/// Expands the configured targets into work items
///
/// Each target yields `categories × (zones, or no zone) × ranges`, in
/// configuration order.
pub fn work_list(config: &Config) -> Result<Vec<WorkItem>, HarvestError> {
    let mut items = Vec::new();

    for target in &config.targets {
        let zones: Vec<Option<&str>> = if target.zones.is_empty() {
            vec![None]
        } else {
            target.zones.iter().map(|z| Some(z.as_str())).collect()
        };

        for category in &target.categories {
            for zone in &zones {
                let segment = Segment::new(&target.transaction, category, *zone);
                for [low, high] in &target.ranges {
                    items.push(WorkItem {
                        segment: segment.clone(),
                        range: PartitionRange::new(*low, *high)?,
                    });
                }
            }
        }
    }

    Ok(items)
}

fn plan_limits(config: &Config) -> PlanLimits {
    PlanLimits {
        window_limit: config.crawler.window_limit(),
        max_depth: config.crawler.max_depth,
        min_slice: config.crawler.min_slice,
    }
}

fn build_fetcher(
    config: &Config,
    api: Arc<dyn SearchApi>,
    stats: Arc<CrawlStats>,
    cancel: CancellationToken,
) -> Arc<ResilientFetcher> {
    Arc::new(ResilientFetcher::new(
        api,
        RetryPolicy::from(&config.retry),
        Arc::new(RateLimiter::from_millis(config.crawler.rate_limit_delay)),
        stats,
        cancel,
    ))
}

/// Outcome of a crawl that ran to an orderly end
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub run_id: i64,
    pub status: RunStatus,
    pub stats: StatsSnapshot,
    pub duration: Duration,
}

/// Everything a leaf worker needs, shared by all of them
struct LeafContext {
    storage: Arc<dyn Storage>,
    fetcher: Arc<ResilientFetcher>,
    stats: Arc<CrawlStats>,
    limits: SliceLimits,
    run_id: i64,
    abort: CancellationToken,
    started: Instant,
}

impl LeafContext {
    /// Pages one leaf into storage
    ///
    /// Fetch failures end only this leaf. A storage failure cancels the whole
    /// crawl and is returned.
    async fn crawl_leaf(
        &self,
        segment: Segment,
        leaf: LeafPartition,
        _permit: OwnedSemaphorePermit,
    ) -> Result<(), StorageError> {
        let record_ctx = RecordContext::new(self.run_id, &segment);
        let mut pager = SlicePager::new(self.fetcher.clone(), segment.clone(), &leaf, self.limits);

        loop {
            let page = match pager.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(
                        "Leaf {} {} interrupted after {} records",
                        segment,
                        leaf.range,
                        pager.delivered()
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.stats.leaf_failed();
                    tracing::warn!(
                        "Abandoning leaf {} {} after {} records: {}",
                        segment,
                        leaf.range,
                        pager.delivered(),
                        e
                    );
                    self.log_progress();
                    return Ok(());
                }
            };

            self.ingest(&page, &record_ctx).inspect_err(|_| self.abort.cancel())?;
        }

        if pager.truncated() {
            // Left incomplete so a resumed run pages it again
            self.stats.leaf_truncated();
            tracing::warn!(
                "Leaf {} {} hit the page cap after {} records in {} pages",
                segment,
                leaf.range,
                pager.delivered(),
                pager.pages()
            );
            self.log_progress();
            return Ok(());
        }

        self.storage
            .mark_leaf_completed(self.run_id, &segment.key(), leaf.range, pager.delivered())
            .inspect_err(|_| self.abort.cancel())?;
        self.stats.leaf_crawled();

        tracing::debug!(
            "Completed leaf {} {}: {} records in {} pages",
            segment,
            leaf.range,
            pager.delivered(),
            pager.pages()
        );
        self.log_progress();
        Ok(())
    }

    fn ingest(
        &self,
        page: &[RawRecord],
        record_ctx: &RecordContext,
    ) -> Result<(), StorageError> {
        let (mut inserted, mut updated, mut skipped) = (0, 0, 0);
        for record in page {
            match self.storage.upsert_record(record, record_ctx)? {
                UpsertOutcome::Inserted => inserted += 1,
                UpsertOutcome::Updated => updated += 1,
                UpsertOutcome::Skipped => skipped += 1,
            }
        }
        self.stats
            .record_page(page.len() as u64, inserted, updated, skipped);
        Ok(())
    }

    fn log_progress(&self) {
        let stats = self.stats.snapshot();
        let finished = stats.leaves_crawled + stats.leaves_failed + stats.leaves_truncated;
        if finished % PROGRESS_INTERVAL == 0 {
            let rate = stats.records_observed as f64 / self.started.elapsed().as_secs_f64();
            tracing::info!(
                "Progress: {} leaves done ({} failed), {} records ({} new, {} updated), {:.2} records/sec",
                finished,
                stats.leaves_failed,
                stats.records_observed,
                stats.inserted,
                stats.updated,
                rate
            );
        }
    }
}

/// Main crawl coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    fetcher: Arc<ResilientFetcher>,
    planner: PartitionPlanner,
    stats: Arc<CrawlStats>,
    /// Cancelled by the caller to interrupt the crawl
    cancel: CancellationToken,
    /// Child of `cancel`, also cancelled on a fatal storage error
    abort: CancellationToken,
    run_id: i64,
    completed: HashSet<(String, PartitionRange)>,
}

impl Coordinator {
    /// Creates a coordinator over SQLite and the HTTP search API
    ///
    /// # Arguments
    ///
    /// * `config` - The harvester configuration
    /// * `config_hash` - Hash of the configuration file, used to match resumable runs
    /// * `fresh` - Whether to start a new run even if an unfinished one exists
    /// * `cancel` - Token that interrupts the crawl when cancelled
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Successfully created coordinator
    /// * `Err(HarvestError)` - Failed to open storage or build the HTTP client
    pub fn new(
        config: Config,
        config_hash: &str,
        fresh: bool,
        cancel: CancellationToken,
    ) -> Result<Self, HarvestError> {
        let storage = Arc::new(SqliteStorage::new(Path::new(&config.output.database_path))?);
        let api = Arc::new(HttpSearchApi::new(&config.api)?);
        Self::with_backends(config, storage, api, config_hash, fresh, cancel)
    }

    /// Creates a coordinator over arbitrary storage and search backends
    pub fn with_backends(
        config: Config,
        storage: Arc<dyn Storage>,
        api: Arc<dyn SearchApi>,
        config_hash: &str,
        fresh: bool,
        cancel: CancellationToken,
    ) -> Result<Self, HarvestError> {
        let (run_id, completed) = open_run(storage.as_ref(), config_hash, fresh)?;

        let stats = Arc::new(CrawlStats::new());
        let abort = cancel.child_token();
        let fetcher = build_fetcher(&config, api, stats.clone(), abort.clone());

        Ok(Self {
            planner: PartitionPlanner::new(plan_limits(&config)),
            config: Arc::new(config),
            storage,
            fetcher,
            stats,
            cancel,
            abort,
            run_id,
            completed,
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Runs the crawl to completion, interruption or fatal error
    ///
    /// Planning and dispatch happen on the calling task; each leaf is paged by
    /// a spawned worker once a concurrency permit is free. Permanent fetch
    /// failures are counted and leave the run `partial`; only storage failures
    /// end the crawl with an error.
    pub async fn run(&self) -> Result<CrawlReport, HarvestError> {
        let started = Instant::now();
        let work = work_list(&self.config)?;
        tracing::info!(
            "Starting crawl run {}: {} work items, concurrency {}",
            self.run_id,
            work.len(),
            self.config.crawler.concurrency
        );

        let prober = FetchProber::new(self.fetcher.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.crawler.concurrency.max(1) as usize));
        let ctx = Arc::new(LeafContext {
            storage: self.storage.clone(),
            fetcher: self.fetcher.clone(),
            stats: self.stats.clone(),
            limits: SliceLimits::from_config(&self.config.crawler),
            run_id: self.run_id,
            abort: self.abort.clone(),
            started,
        });
        let mut tasks = JoinSet::new();

        'work: for item in &work {
            if self.abort.is_cancelled() {
                break;
            }

            let leaves = self
                .planner
                .plan(&prober, &item.segment, item.range, &self.stats, &self.abort)
                .await;
            tracing::info!(
                "Planned {} {} into {} leaves",
                item.segment,
                item.range,
                leaves.len()
            );

            for leaf in leaves {
                if self.completed.contains(&(item.segment.key(), leaf.range)) {
                    self.stats.leaf_skipped();
                    continue;
                }

                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'work,
                    },
                    _ = self.abort.cancelled() => break 'work,
                };

                let ctx = ctx.clone();
                let segment = item.segment.clone();
                tasks.spawn(async move { ctx.crawl_leaf(segment, leaf, permit).await });
            }
        }

        let mut fatal: Option<HarvestError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Storage failure, stopping crawl: {}", e);
                    fatal.get_or_insert(e.into());
                }
                Err(e) => {
                    tracing::error!("Leaf worker panicked: {}", e);
                    self.stats.leaf_failed();
                }
            }
        }

        let stats = self.stats.snapshot();
        let status = if fatal.is_some() {
            RunStatus::Failed
        } else if self.cancel.is_cancelled() {
            RunStatus::Interrupted
        } else if stats.has_gaps() {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };

        if let Some(error) = fatal {
            if let Err(e) = self.storage.finish_run(self.run_id, status, &stats) {
                tracing::error!("Failed to record failure of run {}: {}", self.run_id, e);
            }
            return Err(error);
        }

        self.storage.finish_run(self.run_id, status, &stats)?;

        let duration = started.elapsed();
        tracing::info!(
            "Crawl run {} {}: {} records ({} new) from {} leaves in {:?}",
            self.run_id,
            status.to_db_string(),
            stats.records_observed,
            stats.inserted,
            stats.leaves_crawled,
            duration
        );

        Ok(CrawlReport {
            run_id: self.run_id,
            status,
            stats,
            duration,
        })
    }
}

/// Resumes the latest unfinished run of the same configuration, or creates a new one
fn open_run(
    storage: &dyn Storage,
    config_hash: &str,
    fresh: bool,
) -> Result<(i64, HashSet<(String, PartitionRange)>), HarvestError> {
    if !fresh {
        if let Some(latest) = storage.get_latest_run()? {
            if latest.status.is_resumable() && latest.config_hash == config_hash {
                let completed: HashSet<_> =
                    storage.completed_leaves(latest.id)?.into_iter().collect();
                tracing::info!(
                    "Resuming {} run {} ({} leaves already completed)",
                    latest.status.to_db_string(),
                    latest.id,
                    completed.len()
                );
                return Ok((latest.id, completed));
            }
        }
    }

    let run_id = storage.create_run(config_hash)?;
    tracing::info!("Starting new run {}", run_id);
    Ok((run_id, HashSet::new()))
}

/// Runs a complete crawl against the configured API and database
pub async fn run_crawl(
    config: Config,
    config_hash: &str,
    fresh: bool,
    cancel: CancellationToken,
) -> Result<CrawlReport, HarvestError> {
    let coordinator = Coordinator::new(config, config_hash, fresh, cancel)?;
    coordinator.run().await
}

/// Plans every work item without crawling or touching storage
pub async fn plan_only(
    config: &Config,
    cancel: CancellationToken,
) -> Result<Vec<(WorkItem, Vec<LeafPartition>)>, HarvestError> {
    let api = Arc::new(HttpSearchApi::new(&config.api)?);
    plan_with(config, api, cancel).await
}

pub(crate) async fn plan_with(
    config: &Config,
    api: Arc<dyn SearchApi>,
    cancel: CancellationToken,
) -> Result<Vec<(WorkItem, Vec<LeafPartition>)>, HarvestError> {
    let stats = Arc::new(CrawlStats::new());
    let fetcher = build_fetcher(config, api, stats.clone(), cancel.clone());
    let prober = FetchProber::new(fetcher);
    let planner = PartitionPlanner::new(plan_limits(config));

    let mut plans = Vec::new();
    for item in work_list(config)? {
        if cancel.is_cancelled() {
            break;
        }
        let leaves = planner
            .plan(&prober, &item.segment, item.range, &stats, &cancel)
            .await;
        plans.push((item, leaves));
    }
    Ok(plans)
}
