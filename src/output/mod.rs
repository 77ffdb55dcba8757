//! Output module for crawl reports and store statistics

pub mod stats;

pub use stats::{
    load_statistics, print_crawl_report, print_statistics, render_crawl_report,
    render_statistics, StoreStatistics,
};
