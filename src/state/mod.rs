//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `PartitionRange` / `PartitionNode` / `LeafPartition`: the key-space units the planner works on
//! - `Segment`: one transaction × category × zone filter combination
//! - `CrawlStats`: atomic counters shared by every component of a crawl

mod crawl_stats;
mod partition;

// Re-export main types
pub use crawl_stats::{CrawlStats, StatsSnapshot};
pub use partition::{LeafPartition, PartitionNode, PartitionRange, Segment};
