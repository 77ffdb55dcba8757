//! Adaptive range partitioning
//!
//! The search API never pages past its result window, so a coarse range whose
//! match count exceeds the window is bisected until every piece fits. The
//! planner only needs match counts, which it gets from an injected [`Prober`].

use crate::crawler::fetcher::{FetchRequest, ResilientFetcher};
use crate::state::{CrawlStats, LeafPartition, PartitionNode, PartitionRange, Segment};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Learns the true match count of a range
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns the match count, or `None` when it could not be determined
    async fn probe(&self, segment: &Segment, range: PartitionRange) -> Option<u64>;
}

/// Prober issuing one minimal page request through the resilient fetcher
pub struct FetchProber {
    fetcher: Arc<ResilientFetcher>,
}

impl FetchProber {
    pub fn new(fetcher: Arc<ResilientFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Prober for FetchProber {
    async fn probe(&self, segment: &Segment, range: PartitionRange) -> Option<u64> {
        match self.fetcher.fetch(&FetchRequest::probe(segment, range)).await {
            Ok(response) => Some(response.total),
            Err(e) => {
                if !e.is_cancelled() {
                    self.fetcher.stats().probe_failed();
                    tracing::warn!("Probe failed for {} {}: {}", segment, range, e);
                }
                None
            }
        }
    }
}

/// Recursion floor and acceptance threshold of the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    /// Largest match count accepted for a leaf
    pub window_limit: u64,
    pub max_depth: u32,
    /// Ranges this narrow or narrower are never split
    pub min_slice: i64,
}

impl PlanLimits {
    fn at_floor(&self, node: &PartitionNode) -> bool {
        node.depth >= self.max_depth || node.range.width() <= self.min_slice
    }
}

pub struct PartitionPlanner {
    limits: PlanLimits,
}

impl PartitionPlanner {
    pub fn new(limits: PlanLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> PlanLimits {
        self.limits
    }

    /// Resolves a coarse range into leaf partitions
    ///
    /// # Arguments
    ///
    /// * `prober` - Source of match counts
    /// * `segment` - Filter combination the range belongs to
    /// * `coarse` - The range to resolve
    /// * `stats` - Counters for probes, subdivisions and capped leaves
    /// * `cancel` - Checked before every probe
    ///
    /// # Returns
    ///
    /// Leaves in ascending order, contiguous except where a sub-range had no
    /// matches. A cancelled plan returns the leaves resolved so far.
    pub async fn plan(
        &self,
        prober: &dyn Prober,
        segment: &Segment,
        coarse: PartitionRange,
        stats: &CrawlStats,
        cancel: &CancellationToken,
    ) -> Vec<LeafPartition> {
        let mut leaves = Vec::new();
        // Depth-first with the right child pushed first, so leaves come out ascending
        let mut stack = vec![PartitionNode::root(coarse)];

        while let Some(mut node) = stack.pop() {
            if cancel.is_cancelled() {
                tracing::info!("Planning of {} {} cancelled", segment, coarse);
                break;
            }

            node.probed_count = prober.probe(segment, node.range).await;
            stats.partition_probed();
            tracing::debug!(
                "Probed {} {} at depth {}: {:?}",
                segment,
                node.range,
                node.depth,
                node.probed_count
            );

            match node.probed_count {
                Some(0) => continue,
                Some(count) if count <= self.limits.window_limit => {
                    leaves.push(leaf(&node, false));
                    continue;
                }
                _ => {}
            }

            let children = if self.limits.at_floor(&node) {
                None
            } else {
                node.children()
            };

            match children {
                Some((left, right)) => {
                    stats.partition_subdivided();
                    stack.push(right);
                    stack.push(left);
                }
                None => {
                    stats.partition_capped();
                    tracing::warn!(
                        "Capped partition {} {} at depth {} (count {}): only the first {} results are reachable",
                        segment,
                        node.range,
                        node.depth,
                        node.probed_count
                            .map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                        self.limits.window_limit
                    );
                    leaves.push(leaf(&node, true));
                }
            }
        }

        leaves
    }
}

fn leaf(node: &PartitionNode, capped: bool) -> LeafPartition {
    LeafPartition {
        range: node.range,
        depth: node.depth,
        probed_count: node.probed_count,
        capped,
    }
}
